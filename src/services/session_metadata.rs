//! Typed view of the metadata bag written onto checkout sessions.
//!
//! Stripe metadata values are flat strings, so the line items travel as two parallel
//! comma-joined lists (`purchaseIds`, `sopIds`) plus the buyer id. They are parsed into
//! [`LineItemRef`] pairs here and nowhere else.

use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub const PURCHASE_IDS_KEY: &str = "purchaseIds";
pub const SOP_IDS_KEY: &str = "sopIds";
pub const USER_ID_KEY: &str = "userId";
const BUYER_ID_ALIAS: &str = "buyerId";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("missing metadata field `{0}`")]
    Missing(&'static str),

    #[error("metadata lists {purchases} purchase ids but {sops} sop ids")]
    LengthMismatch { purchases: usize, sops: usize },

    #[error("metadata references no purchases")]
    Empty,

    #[error("invalid id `{value}` in `{field}`")]
    InvalidId { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineItemRef {
    pub purchase_id: Uuid,
    pub sop_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub buyer_id: String,
    pub line_items: Vec<LineItemRef>,
}

impl SessionMetadata {
    pub fn new(buyer_id: impl Into<String>, line_items: Vec<LineItemRef>) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            line_items,
        }
    }

    pub fn parse(metadata: &HashMap<String, String>) -> Result<Self, MetadataError> {
        let purchase_ids = parse_id_list(metadata, PURCHASE_IDS_KEY)?;
        let sop_ids = parse_id_list(metadata, SOP_IDS_KEY)?;

        let buyer_id = metadata
            .get(USER_ID_KEY)
            .or_else(|| metadata.get(BUYER_ID_ALIAS))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(MetadataError::Missing(USER_ID_KEY))?;

        if purchase_ids.len() != sop_ids.len() {
            return Err(MetadataError::LengthMismatch {
                purchases: purchase_ids.len(),
                sops: sop_ids.len(),
            });
        }
        if purchase_ids.is_empty() {
            return Err(MetadataError::Empty);
        }

        let line_items = purchase_ids
            .into_iter()
            .zip(sop_ids)
            .map(|(purchase_id, sop_id)| LineItemRef {
                purchase_id,
                sop_id,
            })
            .collect();

        Ok(Self::new(buyer_id, line_items))
    }

    /// Wire representation written when the checkout session is created.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        let join = |ids: Vec<Uuid>| {
            ids.iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        HashMap::from([
            (PURCHASE_IDS_KEY.to_string(), join(self.purchase_ids())),
            (
                SOP_IDS_KEY.to_string(),
                join(self.line_items.iter().map(|i| i.sop_id).collect()),
            ),
            (USER_ID_KEY.to_string(), self.buyer_id.clone()),
        ])
    }

    pub fn purchase_ids(&self) -> Vec<Uuid> {
        self.line_items.iter().map(|i| i.purchase_id).collect()
    }
}

/// Reads only `purchaseIds`; payment intent metadata carries nothing else.
pub fn parse_purchase_ids(metadata: &HashMap<String, String>) -> Result<Vec<Uuid>, MetadataError> {
    let ids = parse_id_list(metadata, PURCHASE_IDS_KEY)?;
    if ids.is_empty() {
        return Err(MetadataError::Empty);
    }
    Ok(ids)
}

fn parse_id_list(
    metadata: &HashMap<String, String>,
    field: &'static str,
) -> Result<Vec<Uuid>, MetadataError> {
    let raw = metadata.get(field).ok_or(MetadataError::Missing(field))?;
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s).map_err(|_| MetadataError::InvalidId {
                field,
                value: s.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_parallel_lists_with_whitespace_and_blanks() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        let purchases = format!(" {p1} ,, {p2},");
        let sops = format!("{s1}, {s2}");
        let raw = bag(&[
            (PURCHASE_IDS_KEY, purchases.as_str()),
            (SOP_IDS_KEY, sops.as_str()),
            (USER_ID_KEY, "u1"),
        ]);

        let parsed = SessionMetadata::parse(&raw).unwrap();
        assert_eq!(parsed.buyer_id, "u1");
        assert_eq!(
            parsed.line_items,
            vec![
                LineItemRef {
                    purchase_id: p1,
                    sop_id: s1
                },
                LineItemRef {
                    purchase_id: p2,
                    sop_id: s2
                },
            ]
        );
    }

    #[test]
    fn accepts_buyer_id_alias() {
        let id = Uuid::new_v4().to_string();
        let raw = bag(&[
            (PURCHASE_IDS_KEY, id.as_str()),
            (SOP_IDS_KEY, id.as_str()),
            ("buyerId", "u2"),
        ]);
        assert_eq!(SessionMetadata::parse(&raw).unwrap().buyer_id, "u2");
    }

    #[test]
    fn missing_fields_are_rejected() {
        let id = Uuid::new_v4().to_string();
        let id = id.as_str();
        assert_eq!(
            SessionMetadata::parse(&bag(&[(SOP_IDS_KEY, id), (USER_ID_KEY, "u")])),
            Err(MetadataError::Missing(PURCHASE_IDS_KEY))
        );
        assert_eq!(
            SessionMetadata::parse(&bag(&[(PURCHASE_IDS_KEY, id), (SOP_IDS_KEY, id)])),
            Err(MetadataError::Missing(USER_ID_KEY))
        );
        assert_eq!(
            SessionMetadata::parse(&bag(&[
                (PURCHASE_IDS_KEY, id),
                (SOP_IDS_KEY, id),
                (USER_ID_KEY, "  ")
            ])),
            Err(MetadataError::Missing(USER_ID_KEY))
        );
    }

    #[test]
    fn mismatched_and_empty_lists_are_rejected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let purchases = format!("{a},{b}");
        let sops = a.to_string();
        let raw = bag(&[
            (PURCHASE_IDS_KEY, purchases.as_str()),
            (SOP_IDS_KEY, sops.as_str()),
            (USER_ID_KEY, "u"),
        ]);
        assert_eq!(
            SessionMetadata::parse(&raw),
            Err(MetadataError::LengthMismatch {
                purchases: 2,
                sops: 1
            })
        );

        let raw = bag(&[(PURCHASE_IDS_KEY, " , "), (SOP_IDS_KEY, ""), (USER_ID_KEY, "u")]);
        assert_eq!(SessionMetadata::parse(&raw), Err(MetadataError::Empty));
    }

    #[test]
    fn garbage_ids_are_rejected() {
        let raw = bag(&[
            (PURCHASE_IDS_KEY, "p1"),
            (SOP_IDS_KEY, "s1"),
            (USER_ID_KEY, "u"),
        ]);
        assert_eq!(
            SessionMetadata::parse(&raw),
            Err(MetadataError::InvalidId {
                field: PURCHASE_IDS_KEY,
                value: "p1".into()
            })
        );
    }

    #[test]
    fn wire_format_reparses_to_the_same_value() {
        let meta = SessionMetadata::new(
            "buyer-9",
            vec![
                LineItemRef {
                    purchase_id: Uuid::new_v4(),
                    sop_id: Uuid::new_v4(),
                },
                LineItemRef {
                    purchase_id: Uuid::new_v4(),
                    sop_id: Uuid::new_v4(),
                },
            ],
        );
        let wire = meta.to_metadata();
        assert_eq!(wire[PURCHASE_IDS_KEY].matches(',').count(), 1);
        assert_eq!(SessionMetadata::parse(&wire).unwrap(), meta);
    }

    #[test]
    fn purchase_ids_only() {
        let a = Uuid::new_v4();
        let purchases = format!("{a},");
        let raw = bag(&[(PURCHASE_IDS_KEY, purchases.as_str())]);
        assert_eq!(parse_purchase_ids(&raw).unwrap(), vec![a]);
        assert_eq!(
            parse_purchase_ids(&HashMap::new()),
            Err(MetadataError::Missing(PURCHASE_IDS_KEY))
        );
    }
}
