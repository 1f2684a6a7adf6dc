//! Synthetic CRM entities for exercising the pipeline.
use cdc_common::event::Snapshot;
use cdc_common::schema::ObjectType;
use cdc_common::time::format_timestamp;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

pub const GENERATOR_SOURCE: &str = "synthetic_generator";

const ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const ACCOUNT_TYPES: &[&str] = &["Prospect", "Customer", "Partner", "Reseller", "Channel Partner"];
pub const INDUSTRIES: &[&str] = &[
    "Technology",
    "Healthcare",
    "Finance",
    "Manufacturing",
    "Retail",
    "Education",
    "Government",
    "Non-Profit",
    "Consulting",
    "Real Estate",
];
pub const OPPORTUNITY_STAGES: &[&str] = &[
    "Prospecting",
    "Qualification",
    "Needs Analysis",
    "Value Proposition",
    "Proposal/Price Quote",
    "Negotiation/Review",
    "Closed Won",
    "Closed Lost",
];
pub const OPPORTUNITY_TYPES: &[&str] = &["New Business", "Existing Business", "New Customer", "Community"];
pub const LEAD_SOURCES: &[&str] = &[
    "Web",
    "Phone Inquiry",
    "Partner Referral",
    "Purchased List",
    "Other",
    "Trade Show",
    "Website",
    "Word of Mouth",
    "Employee Referral",
];
pub const CASE_ORIGINS: &[&str] = &["Web", "Email", "Phone", "Chat", "Social Media"];
pub const CASE_STATUSES: &[&str] = &["New", "Working", "Escalated", "Closed"];
pub const CASE_PRIORITIES: &[&str] = &["High", "Medium", "Low"];
pub const CONTACT_TITLES: &[&str] = &[
    "CEO",
    "CTO",
    "CFO",
    "VP of Sales",
    "Sales Manager",
    "Sales Director",
    "Account Executive",
    "Business Analyst",
    "IT Manager",
    "Operations Manager",
    "Marketing Director",
];

const COMPANY_WORDS: &[&str] = &[
    "Acme", "Globex", "Initech", "Umbrella", "Stark", "Wayne", "Hooli", "Vandelay", "Soylent",
    "Tyrell", "Cyberdyne", "Wonka",
];
const COMPANY_SUFFIXES: &[&str] = &["Inc", "LLC", "Group", "Ltd", "Partners", "Holdings"];
const FIRST_NAMES: &[&str] = &[
    "Ada", "Grace", "Alan", "Edsger", "Barbara", "Donald", "Margaret", "Ken", "Frances", "Dennis",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Knuth", "Hamilton", "Thompson", "Allen",
    "Ritchie",
];
const CITIES: &[(&str, &str)] = &[
    ("Springfield", "IL"),
    ("Portland", "OR"),
    ("Austin", "TX"),
    ("Madison", "WI"),
    ("Boulder", "CO"),
];
const STREETS: &[&str] = &["Main St", "Oak Ave", "Pine Rd", "Maple Dr", "Cedar Ln"];
const PHRASES: &[&str] = &[
    "Enterprise rollout",
    "Platform migration",
    "Annual renewal",
    "Analytics expansion",
    "Support upgrade",
];
const ISSUES: &[&str] = &[
    "Login fails after password reset",
    "Invoice shows wrong amount",
    "Export times out on large reports",
    "Dashboard widgets do not load",
    "Sync stopped overnight",
];

/// Identifiers of existing entities that new entities may reference.
#[derive(Debug, Clone, Default)]
pub struct Related<'a> {
    pub account_ids: &'a [String],
    pub contact_ids: &'a [String],
}

/// Produces realistic snapshots of the four tracked entity types.
pub struct EntityGenerator {
    rng: StdRng,
}

impl Default for EntityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A generator producing the same entities for the same seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// The entity's three character key prefix followed by 15 characters.
    pub fn generate_id(&mut self, object_type: ObjectType) -> String {
        let suffix: String = (0..15)
            .map(|_| char::from(ID_CHARS[self.rng.gen_range(0..ID_CHARS.len())]))
            .collect();
        format!("{}{}", object_type.key_prefix(), suffix)
    }

    /// A random instant at most `days_back` days (plus up to a day) before `now`.
    pub fn timestamp(&mut self, now: DateTime<Utc>, days_back: i64) -> DateTime<Utc> {
        let days = self.rng.gen_range(0..=days_back);
        let hours = self.rng.gen_range(0..24);
        let minutes = self.rng.gen_range(0..60);
        now - Duration::days(days) - Duration::hours(hours) - Duration::minutes(minutes)
    }

    pub fn choose(&mut self, values: &[&'static str]) -> &'static str {
        values.choose(&mut self.rng).copied().unwrap_or_default()
    }

    fn reference(&mut self, ids: &[String], object_type: ObjectType) -> String {
        match ids.choose(&mut self.rng) {
            Some(id) => id.clone(),
            None => self.generate_id(object_type),
        }
    }

    pub fn company_name(&mut self) -> String {
        format!(
            "{} {}",
            self.choose(COMPANY_WORDS),
            self.choose(COMPANY_SUFFIXES)
        )
    }

    pub fn phone_number(&mut self) -> String {
        format!(
            "+1-{:03}-{:03}-{:04}",
            self.rng.gen_range(200..1000),
            self.rng.gen_range(200..1000),
            self.rng.gen_range(0..10000)
        )
    }

    pub fn email(&mut self) -> String {
        format!(
            "{}.{}{}@example.com",
            self.choose(FIRST_NAMES).to_lowercase(),
            self.choose(LAST_NAMES).to_lowercase(),
            self.rng.gen_range(1..1000)
        )
    }

    fn address(&mut self) -> Value {
        let (city, state) = CITIES.choose(&mut self.rng).copied().unwrap_or(("Springfield", "IL"));
        json!({
            "street": format!("{} {}", self.rng.gen_range(1..9999), self.choose(STREETS)),
            "city": city,
            "state": state,
            "postal_code": format!("{:05}", self.rng.gen_range(10000..100000)),
            "country": "United States",
        })
    }

    /// A snapshot of a new entity, created at a random point in the past.
    pub fn generate(
        &mut self,
        object_type: ObjectType,
        now: DateTime<Utc>,
        related: &Related<'_>,
    ) -> Snapshot {
        let created_days = match object_type {
            ObjectType::Account => 730,
            ObjectType::Contact | ObjectType::Opportunity => 365,
            ObjectType::Case => 180,
        };
        let created = format_timestamp(&self.timestamp(now, created_days));
        let modified = format_timestamp(&self.timestamp(now, 30));

        let mut snapshot = Snapshot::new();
        snapshot.insert("id", self.generate_id(object_type).into());
        match object_type {
            ObjectType::Account => {
                snapshot.insert("name", self.company_name().into());
                snapshot.insert("type", self.choose(ACCOUNT_TYPES).into());
                snapshot.insert("industry", self.choose(INDUSTRIES).into());
                snapshot.insert(
                    "annual_revenue",
                    self.rng.gen_range(100_000..10_000_000_i64).into(),
                );
                snapshot.insert("phone", self.phone_number().into());
                let website = format!(
                    "https://{}.example.com",
                    self.choose(COMPANY_WORDS).to_lowercase()
                );
                snapshot.insert("website", website.into());
                snapshot.insert("billing_address", self.address());
                snapshot.insert("shipping_address", self.address());
            }
            ObjectType::Contact => {
                let account_id = self.reference(related.account_ids, ObjectType::Account);
                snapshot.insert("account_id", account_id.into());
                snapshot.insert("first_name", self.choose(FIRST_NAMES).into());
                snapshot.insert("last_name", self.choose(LAST_NAMES).into());
                snapshot.insert("email", self.email().into());
                snapshot.insert("phone", self.phone_number().into());
                snapshot.insert("title", self.choose(CONTACT_TITLES).into());
                snapshot.insert("lead_source", self.choose(LEAD_SOURCES).into());
            }
            ObjectType::Opportunity => {
                let account_id = self.reference(related.account_ids, ObjectType::Account);
                let is_closed: bool = self.rng.gen();
                let close_date = if is_closed {
                    Value::String(self.timestamp(now, 60).date_naive().to_string())
                } else {
                    Value::Null
                };
                snapshot.insert("account_id", account_id.into());
                snapshot.insert("name", self.choose(PHRASES).into());
                snapshot.insert("stage_name", self.choose(OPPORTUNITY_STAGES).into());
                snapshot.insert("type", self.choose(OPPORTUNITY_TYPES).into());
                snapshot.insert("lead_source", self.choose(LEAD_SOURCES).into());
                snapshot.insert("amount", self.rng.gen_range(10_000..500_000_i64).into());
                snapshot.insert("probability", self.rng.gen_range(1..=100_i64).into());
                snapshot.insert("close_date", close_date);
                snapshot.insert("is_won", self.rng.gen::<bool>().into());
                snapshot.insert("is_closed", is_closed.into());
            }
            ObjectType::Case => {
                let account_id = self.reference(related.account_ids, ObjectType::Account);
                let contact_id = self.reference(related.contact_ids, ObjectType::Contact);
                let is_closed: bool = self.rng.gen();
                let closed_date = if is_closed {
                    Value::String(format_timestamp(&self.timestamp(now, 15)))
                } else {
                    Value::Null
                };
                let subject = self.choose(ISSUES);
                snapshot.insert("account_id", account_id.into());
                snapshot.insert("contact_id", contact_id.into());
                snapshot.insert("subject", subject.into());
                snapshot.insert(
                    "description",
                    format!("Customer reports: {}.", subject.to_lowercase()).into(),
                );
                snapshot.insert("status", self.choose(CASE_STATUSES).into());
                snapshot.insert("origin", self.choose(CASE_ORIGINS).into());
                snapshot.insert("priority", self.choose(CASE_PRIORITIES).into());
                snapshot.insert("is_escalated", self.rng.gen::<bool>().into());
                snapshot.insert("is_closed", is_closed.into());
                snapshot.insert("closed_date", closed_date);
            }
        }
        snapshot.insert("created_date", created.into());
        snapshot.insert("last_modified_date", modified.clone().into());
        snapshot.insert("system_modstamp", modified.into());
        snapshot.insert("ingestion_timestamp", format_timestamp(&now).into());
        snapshot.insert("source", GENERATOR_SOURCE.into());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_common::schema::is_valid_identifier;

    fn now() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn ids_carry_the_entity_key_prefix() {
        let mut generator = EntityGenerator::with_seed(7);
        for object_type in ObjectType::ALL {
            let id = generator.generate_id(object_type);
            assert_eq!(id.len(), 18);
            assert!(id.starts_with(object_type.key_prefix()));
            assert!(is_valid_identifier(&id));
        }
    }

    #[test]
    fn snapshots_satisfy_the_entity_schema() {
        let mut generator = EntityGenerator::with_seed(42);
        for object_type in ObjectType::ALL {
            for _ in 0..20 {
                let snapshot = generator.generate(object_type, now(), &Related::default());
                for field in object_type.required_fields() {
                    assert!(snapshot.get(field).is_some(), "{object_type} lacks {field}");
                }
                for (field, kind) in object_type.field_kinds() {
                    if let Some(value) = snapshot.get(field) {
                        assert!(kind.matches(value), "{object_type}.{field} = {value}");
                    }
                }
            }
        }
    }

    #[test]
    fn references_existing_entities() {
        let mut generator = EntityGenerator::with_seed(1);
        let accounts = vec!["001AAAAAAAAAAAAAAA".to_owned()];
        let contacts = vec!["003BBBBBBBBBBBBBBB".to_owned()];
        let related = Related {
            account_ids: &accounts,
            contact_ids: &contacts,
        };

        let case = generator.generate(ObjectType::Case, now(), &related);
        assert_eq!(case.get("account_id"), Some(&json!("001AAAAAAAAAAAAAAA")));
        assert_eq!(case.get("contact_id"), Some(&json!("003BBBBBBBBBBBBBBB")));
    }

    #[test]
    fn timestamps_stay_in_the_past() {
        let mut generator = EntityGenerator::with_seed(3);
        for _ in 0..100 {
            let ts = generator.timestamp(now(), 30);
            assert!(ts <= now());
            assert!(ts > now() - Duration::days(32));
        }
    }

    #[test]
    fn seeded_generators_repeat_themselves() {
        let a = EntityGenerator::with_seed(9).generate(ObjectType::Account, now(), &Related::default());
        let b = EntityGenerator::with_seed(9).generate(ObjectType::Account, now(), &Related::default());
        assert_eq!(a, b);
    }
}
