//! Game-account lookup. Resolves a `(user id, zone id)` pair to the
//! in-game nickname, region and top-up promotion eligibility.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Promotion {
    /// Tier label, e.g. `"50+50"`.
    pub tier: String,
    pub limit_reached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameAccount {
    pub user_id: String,
    pub zone_id: String,
    pub username: String,
    pub region: Option<String>,
    pub promotions: Vec<Promotion>,
}

#[derive(Debug, Deserialize)]
struct RawPromotion {
    #[serde(alias = "label", alias = "title")]
    tier: String,
    #[serde(default, alias = "limitReached", alias = "reached")]
    limit_reached: bool,
}

#[derive(Debug, Clone)]
pub struct LookupClient {
    client: Client,
    base_url: String,
}

impl LookupClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn lookup(&self, user_id: &str, zone_id: &str) -> Result<GameAccount> {
        if !is_numeric_id(user_id) || !is_numeric_id(zone_id) {
            return Err(StoreError::Validation(
                "user id and zone id must be numeric".to_string(),
            ));
        }

        let url = format!("{}/{user_id}/{zone_id}", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            debug!("Lookup {user_id}/{zone_id} answered {status}");
            return Err(StoreError::NotFound(format!("game account {user_id}/{zone_id}")));
        }

        let body: Value = resp.json().await?;
        parse_account(user_id, zone_id, &body)
            .ok_or_else(|| StoreError::NotFound(format!("game account {user_id}/{zone_id}")))
    }
}

fn is_numeric_id(raw: &str) -> bool {
    !raw.is_empty() && raw.len() <= 16 && raw.chars().all(|c| c.is_ascii_digit())
}

/// Read the lookup response. Some deployments wrap the payload in `data`.
fn parse_account(user_id: &str, zone_id: &str, body: &Value) -> Option<GameAccount> {
    let payload = body.get("data").filter(|d| d.is_object()).unwrap_or(body);

    let username = payload
        .get("username")
        .or_else(|| payload.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();

    let region = payload
        .get("region")
        .or_else(|| payload.get("country"))
        .and_then(Value::as_str)
        .map(String::from);

    let promotions = payload
        .get("promotions")
        .or_else(|| payload.get("promo"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<RawPromotion>(item.clone()).ok())
                .map(|p| Promotion {
                    tier: p.tier,
                    limit_reached: p.limit_reached,
                })
                .collect()
        })
        .unwrap_or_default();

    Some(GameAccount {
        user_id: user_id.to_string(),
        zone_id: zone_id.to_string(),
        username,
        region,
        promotions,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_flat_payload() {
        let body = json!({
            "username": "Lunox Main",
            "region": "PH",
            "promotions": [
                {"tier": "50+50", "limitReached": true},
                {"label": "150+150", "limitReached": false},
                {"broken": 1}
            ]
        });
        let account = parse_account("12345678", "2001", &body).unwrap();
        assert_eq!(account.username, "Lunox Main");
        assert_eq!(account.region.as_deref(), Some("PH"));
        assert_eq!(
            account.promotions,
            vec![
                Promotion {
                    tier: "50+50".into(),
                    limit_reached: true
                },
                Promotion {
                    tier: "150+150".into(),
                    limit_reached: false
                },
            ]
        );
    }

    #[test]
    fn parses_wrapped_payload() {
        let body = json!({"success": true, "data": {"name": "Chou", "country": "ID"}});
        let account = parse_account("1", "2", &body).unwrap();
        assert_eq!(account.username, "Chou");
        assert_eq!(account.region.as_deref(), Some("ID"));
        assert!(account.promotions.is_empty());
    }

    #[test]
    fn missing_username_is_none() {
        assert!(parse_account("1", "2", &json!({"username": "  "})).is_none());
        assert!(parse_account("1", "2", &json!({"error": "not found"})).is_none());
    }

    #[test]
    fn ids_must_be_digits() {
        assert!(is_numeric_id("12345678"));
        assert!(!is_numeric_id(""));
        assert!(!is_numeric_id("12a"));
        assert!(!is_numeric_id("../admin"));
    }
}
