use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_sops_table::Migration),
            Box::new(m20240301_000002_create_promo_codes_table::Migration),
            Box::new(m20240301_000003_create_purchases_table::Migration),
            Box::new(m20240301_000004_create_revenues_table::Migration),
        ]
    }
}

mod m20240301_000001_create_sops_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_sops_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Sops::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Sops::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Sops::AuthorId).string().not_null())
                        .col(ColumnDef::new(Sops::Title).string().not_null())
                        .col(
                            ColumnDef::new(Sops::Price)
                                .big_integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Sops::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Sops::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_sops_author_id")
                        .table(Sops::Table)
                        .col(Sops::AuthorId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Sops::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Sops {
        Table,
        Id,
        AuthorId,
        Title,
        Price,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_promo_codes_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_promo_codes_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PromoCodes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PromoCodes::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PromoCodes::Code).string().not_null())
                        .col(
                            ColumnDef::new(PromoCodes::Active)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::DiscountType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::DiscountValue)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PromoCodes::MaxDiscount).big_integer().null())
                        .col(ColumnDef::new(PromoCodes::MinPurchase).big_integer().null())
                        .col(ColumnDef::new(PromoCodes::MaxUses).integer().null())
                        .col(
                            ColumnDef::new(PromoCodes::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::StartsAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::ExpiresAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_promo_codes_code")
                        .table(PromoCodes::Table)
                        .col(PromoCodes::Code)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PromoCodes::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum PromoCodes {
        Table,
        Id,
        Code,
        Active,
        DiscountType,
        DiscountValue,
        MaxDiscount,
        MinPurchase,
        MaxUses,
        UsedCount,
        StartsAt,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000003_create_purchases_table {
    use super::m20240301_000001_create_sops_table::Sops;
    use super::m20240301_000002_create_promo_codes_table::PromoCodes;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_purchases_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Purchases::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Purchases::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Purchases::BuyerId).string().not_null())
                        .col(ColumnDef::new(Purchases::SopId).uuid().not_null())
                        .col(ColumnDef::new(Purchases::Amount).big_integer().not_null())
                        .col(
                            ColumnDef::new(Purchases::PlatformFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchases::SellerRevenue)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Purchases::PromoCodeId).uuid().null())
                        .col(
                            ColumnDef::new(Purchases::Status)
                                .string_len(16)
                                .not_null()
                                .default("pending"),
                        )
                        .col(ColumnDef::new(Purchases::StripeSessionId).string().null())
                        .col(ColumnDef::new(Purchases::StripePaymentId).string().null())
                        .col(
                            ColumnDef::new(Purchases::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchases::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_purchases_sop_id")
                                .from(Purchases::Table, Purchases::SopId)
                                .to(Sops::Table, Sops::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_purchases_promo_code_id")
                                .from(Purchases::Table, Purchases::PromoCodeId)
                                .to(PromoCodes::Table, PromoCodes::Id)
                                .on_delete(ForeignKeyAction::SetNull),
                        )
                        .to_owned(),
                )
                .await?;

            // Sweep scans by buyer + status
            manager
                .create_index(
                    Index::create()
                        .name("idx_purchases_buyer_status")
                        .table(Purchases::Table)
                        .col(Purchases::BuyerId)
                        .col(Purchases::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_purchases_stripe_session_id")
                        .table(Purchases::Table)
                        .col(Purchases::StripeSessionId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Purchases::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum Purchases {
        Table,
        Id,
        BuyerId,
        SopId,
        Amount,
        PlatformFee,
        SellerRevenue,
        PromoCodeId,
        Status,
        StripeSessionId,
        StripePaymentId,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000004_create_revenues_table {
    use super::m20240301_000003_create_purchases_table::Purchases;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_revenues_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Revenues::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Revenues::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Revenues::PurchaseId).uuid().not_null())
                        .col(ColumnDef::new(Revenues::SellerId).string().not_null())
                        .col(ColumnDef::new(Revenues::SopId).uuid().not_null())
                        .col(ColumnDef::new(Revenues::Amount).big_integer().not_null())
                        .col(
                            ColumnDef::new(Revenues::PlatformFee)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Revenues::Status)
                                .string_len(16)
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(Revenues::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_revenues_purchase_id")
                                .from(Revenues::Table, Revenues::PurchaseId)
                                .to(Purchases::Table, Purchases::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            // One revenue row per purchase, enforced by storage
            manager
                .create_index(
                    Index::create()
                        .name("idx_revenues_purchase_id_unique")
                        .table(Revenues::Table)
                        .col(Revenues::PurchaseId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_revenues_seller_id")
                        .table(Revenues::Table)
                        .col(Revenues::SellerId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Revenues::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Revenues {
        Table,
        Id,
        PurchaseId,
        SellerId,
        SopId,
        Amount,
        PlatformFee,
        Status,
        CreatedAt,
    }
}

/// Migration CLI runner
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(4)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(true);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
