//! Plan catalog
//!
//! Read-only table of plans and credit packs. Built once at startup (either
//! the built-in table or a JSON file named by `PLAN_CATALOG_PATH`) and shared
//! behind an `Arc` with every component that needs prices or credit grants.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Subscription plan identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanType {
    Free,
    Starter,
    Pro,
    Studio,
}

impl PlanType {
    pub const ALL: [PlanType; 4] = [
        PlanType::Free,
        PlanType::Starter,
        PlanType::Pro,
        PlanType::Studio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "FREE",
            PlanType::Starter => "STARTER",
            PlanType::Pro => "PRO",
            PlanType::Studio => "STUDIO",
        }
    }

    /// Position in the upgrade ladder; used to tell upgrades from downgrades
    pub fn rank(&self) -> u8 {
        match self {
            PlanType::Free => 0,
            PlanType::Starter => 1,
            PlanType::Pro => 2,
            PlanType::Studio => 3,
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != PlanType::Free
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PlanType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(PlanType::Free),
            "STARTER" => Ok(PlanType::Starter),
            "PRO" => Ok(PlanType::Pro),
            "STUDIO" => Ok(PlanType::Studio),
            other => Err(BillingError::InvalidPlan(other.to_string())),
        }
    }
}

/// One catalog row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInfo {
    pub id: PlanType,
    pub name: String,
    pub monthly_price_cents: i64,
    pub monthly_credits: i64,
    pub generation_limit: i32,
}

/// A-la-carte credit pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditPack {
    pub credits: i64,
    pub price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCatalog {
    plans: Vec<PlanInfo>,
    credit_packs: Vec<CreditPack>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlanCatalog {
    /// The table shipped with the service
    pub fn builtin() -> Self {
        let plan = |id, name: &str, price, credits, limit| PlanInfo {
            id,
            name: name.to_string(),
            monthly_price_cents: price,
            monthly_credits: credits,
            generation_limit: limit,
        };

        Self {
            plans: vec![
                plan(PlanType::Free, "Free", 0, 0, 3),
                plan(PlanType::Starter, "Starter", 2990, 50, 10),
                plan(PlanType::Pro, "Pro", 5990, 150, 30),
                plan(PlanType::Studio, "Studio", 9990, 400, 100),
            ],
            credit_packs: vec![
                CreditPack {
                    credits: 10,
                    price_cents: 990,
                },
                CreditPack {
                    credits: 30,
                    price_cents: 2490,
                },
                CreditPack {
                    credits: 50,
                    price_cents: 3990,
                },
                CreditPack {
                    credits: 100,
                    price_cents: 6990,
                },
            ],
        }
    }

    /// Build a catalog from explicit rows, validating that every plan appears exactly once
    pub fn new(plans: Vec<PlanInfo>, credit_packs: Vec<CreditPack>) -> BillingResult<Self> {
        let catalog = Self {
            plans,
            credit_packs,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> BillingResult<Self> {
        let catalog: PlanCatalog = serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("Invalid plan catalog JSON: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load from `PLAN_CATALOG_PATH` when set, otherwise use the built-in table
    pub fn load_from_env() -> BillingResult<Self> {
        match std::env::var("PLAN_CATALOG_PATH") {
            Ok(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    BillingError::Config(format!("Cannot read plan catalog {}: {}", path, e))
                })?;
                let catalog = Self::from_json_str(&raw)?;
                tracing::info!(path = %path, plans = catalog.plans.len(), "Plan catalog loaded from file");
                Ok(catalog)
            }
            _ => Ok(Self::builtin()),
        }
    }

    fn validate(&self) -> BillingResult<()> {
        for plan_type in PlanType::ALL {
            let count = self.plans.iter().filter(|p| p.id == plan_type).count();
            if count != 1 {
                return Err(BillingError::Config(format!(
                    "Plan catalog must define {} exactly once (found {})",
                    plan_type, count
                )));
            }
        }
        if let Some(bad) = self
            .plans
            .iter()
            .find(|p| p.monthly_price_cents < 0 || p.monthly_credits < 0 || p.generation_limit < 0)
        {
            return Err(BillingError::Config(format!(
                "Plan {} has negative values",
                bad.id
            )));
        }
        if let Some(bad) = self
            .credit_packs
            .iter()
            .find(|p| p.credits <= 0 || p.price_cents <= 0)
        {
            return Err(BillingError::Config(format!(
                "Credit pack of {} credits is not positive",
                bad.credits
            )));
        }
        Ok(())
    }

    pub fn plans(&self) -> &[PlanInfo] {
        &self.plans
    }

    pub fn credit_packs(&self) -> &[CreditPack] {
        &self.credit_packs
    }

    pub fn plan(&self, id: PlanType) -> BillingResult<&PlanInfo> {
        self.plans
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| BillingError::InvalidPlan(id.to_string()))
    }

    /// Plans that can be bought through checkout
    pub fn purchasable_plan(&self, id: PlanType) -> BillingResult<&PlanInfo> {
        let plan = self.plan(id)?;
        if !plan.id.is_paid() || plan.monthly_price_cents == 0 {
            return Err(BillingError::InvalidPlan(format!(
                "{} cannot be purchased",
                id
            )));
        }
        Ok(plan)
    }

    pub fn credit_pack(&self, credits: i64) -> BillingResult<&CreditPack> {
        self.credit_packs
            .iter()
            .find(|p| p.credits == credits)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("No credit pack of {} credits", credits))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_values() {
        let catalog = PlanCatalog::builtin();

        let pro = catalog.plan(PlanType::Pro).unwrap();
        assert_eq!(pro.name, "Pro");
        assert_eq!(pro.monthly_price_cents, 5990);
        assert_eq!(pro.monthly_credits, 150);
        assert_eq!(pro.generation_limit, 30);

        let free = catalog.plan(PlanType::Free).unwrap();
        assert_eq!(free.monthly_credits, 0);
        assert_eq!(catalog.plans().len(), 4);
    }

    #[test]
    fn test_free_plan_not_purchasable() {
        let catalog = PlanCatalog::builtin();
        assert!(matches!(
            catalog.purchasable_plan(PlanType::Free),
            Err(BillingError::InvalidPlan(_))
        ));
        assert!(catalog.purchasable_plan(PlanType::Studio).is_ok());
    }

    #[test]
    fn test_credit_pack_lookup() {
        let catalog = PlanCatalog::builtin();
        assert_eq!(catalog.credit_pack(30).unwrap().price_cents, 2490);
        assert!(matches!(
            catalog.credit_pack(31),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_plan_type_parsing() {
        assert_eq!("pro".parse::<PlanType>().unwrap(), PlanType::Pro);
        assert_eq!(" STUDIO ".parse::<PlanType>().unwrap(), PlanType::Studio);
        assert!("gold".parse::<PlanType>().is_err());
        assert_eq!(PlanType::Starter.to_string(), "STARTER");
    }

    #[test]
    fn test_plan_ranking() {
        assert!(PlanType::Studio.rank() > PlanType::Pro.rank());
        assert!(PlanType::Pro.rank() > PlanType::Starter.rank());
        assert!(PlanType::Starter.rank() > PlanType::Free.rank());
    }

    #[test]
    fn test_catalog_json_round_trip_is_swappable() {
        let json = r#"{
            "plans": [
                {"id": "FREE", "name": "Free", "monthlyPriceCents": 0, "monthlyCredits": 0, "generationLimit": 1},
                {"id": "STARTER", "name": "S", "monthlyPriceCents": 100, "monthlyCredits": 5, "generationLimit": 2},
                {"id": "PRO", "name": "P", "monthlyPriceCents": 200, "monthlyCredits": 10, "generationLimit": 3},
                {"id": "STUDIO", "name": "St", "monthlyPriceCents": 300, "monthlyCredits": 20, "generationLimit": 4}
            ],
            "creditPacks": [{"credits": 5, "priceCents": 50}]
        }"#;
        let catalog = PlanCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.plan(PlanType::Pro).unwrap().monthly_credits, 10);
        assert_eq!(catalog.credit_pack(5).unwrap().price_cents, 50);
    }

    #[test]
    fn test_catalog_missing_plan_rejected() {
        let json = r#"{
            "plans": [
                {"id": "FREE", "name": "Free", "monthlyPriceCents": 0, "monthlyCredits": 0, "generationLimit": 1}
            ],
            "creditPacks": []
        }"#;
        assert!(matches!(
            PlanCatalog::from_json_str(json),
            Err(BillingError::Config(_))
        ));
    }
}
