//! Engine profiles: one parametrized matcher per source pairing.

use crate::adapters::{build_adapter, AmountLocation, AmountSign, SourceAdapter, SourceSettings};
use crate::engine::financials::RoleMapping;
use crate::engine::matcher::MatchParams;
use crate::error::MatchError;
use crate::models::Side;
use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

pub const LEDGER_EXCHANGE: &str = "ledger_exchange";
pub const EXCHANGE_LEDGER: &str = "exchange_ledger";
pub const GENERIC: &str = "generic";

/// Amount pointer inside ledger payloads.
pub const LEDGER_AMOUNT_POINTER: &str = "/operation/amount";

/// Declared settings of a profile, before adapters are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSettings {
    pub name: String,
    pub side_a: SourceSettings,
    pub side_b: SourceSettings,
    pub roles: RoleMapping,
    pub amount_tolerance: Decimal,
    pub time_window_secs: i64,
}

impl ProfileSettings {
    /// The built-in pairings. Offsets default to UTC; deployments whose
    /// sources record local time must set them explicitly.
    pub fn builtin() -> Vec<ProfileSettings> {
        let ledger = SourceSettings {
            source: "ledger".to_string(),
            utc_offset_minutes: 0,
            amount: AmountLocation::Payload {
                pointer: LEDGER_AMOUNT_POINTER.to_string(),
            },
            sign: AmountSign::Magnitude,
        };
        let exchange = SourceSettings {
            source: "exchange".to_string(),
            utc_offset_minutes: 0,
            amount: AmountLocation::Column,
            sign: AmountSign::Magnitude,
        };
        let tolerance = Decimal::new(1, 2);

        vec![
            ProfileSettings {
                name: LEDGER_EXCHANGE.to_string(),
                side_a: ledger.clone(),
                side_b: exchange.clone(),
                roles: RoleMapping::SideAExpense,
                amount_tolerance: tolerance,
                time_window_secs: 30 * 60,
            },
            ProfileSettings {
                name: EXCHANGE_LEDGER.to_string(),
                side_a: exchange,
                side_b: ledger,
                roles: RoleMapping::SideBExpense,
                amount_tolerance: tolerance,
                time_window_secs: 30 * 60,
            },
            ProfileSettings {
                name: GENERIC.to_string(),
                side_a: SourceSettings {
                    source: "side_a".to_string(),
                    utc_offset_minutes: 0,
                    amount: AmountLocation::Column,
                    sign: AmountSign::Magnitude,
                },
                side_b: SourceSettings {
                    source: "side_b".to_string(),
                    utc_offset_minutes: 0,
                    amount: AmountLocation::Column,
                    sign: AmountSign::Magnitude,
                },
                roles: RoleMapping::SideAExpense,
                amount_tolerance: tolerance,
                time_window_secs: 30 * 60,
            },
        ]
    }
}

/// A ready-to-run matcher for one source pairing.
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub name: String,
    pub side_a: Arc<dyn SourceAdapter>,
    pub side_b: Arc<dyn SourceAdapter>,
    pub params: MatchParams,
}

impl EngineProfile {
    pub fn from_settings(settings: &ProfileSettings) -> Result<Self, MatchError> {
        if settings.side_a.source == settings.side_b.source {
            return Err(MatchError::Configuration(format!(
                "profile '{}' pairs source '{}' with itself",
                settings.name, settings.side_a.source
            )));
        }

        let time_window = Duration::try_seconds(settings.time_window_secs).ok_or_else(|| {
            MatchError::Configuration(format!(
                "profile '{}': time window of {}s is out of range",
                settings.name, settings.time_window_secs
            ))
        })?;
        let params = MatchParams {
            amount_tolerance: settings.amount_tolerance,
            time_window,
            roles: settings.roles,
        };
        params.validate().map_err(|e| {
            MatchError::Configuration(format!("profile '{}': {}", settings.name, e))
        })?;

        Ok(Self {
            name: settings.name.clone(),
            side_a: build_adapter(&settings.side_a)?,
            side_b: build_adapter(&settings.side_b)?,
            params,
        })
    }

    pub fn adapter(&self, side: Side) -> &dyn SourceAdapter {
        match side {
            Side::A => self.side_a.as_ref(),
            Side::B => self.side_b.as_ref(),
        }
    }
}

/// Profiles by name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, EngineProfile>,
}

impl ProfileRegistry {
    pub fn from_settings(settings: &[ProfileSettings]) -> Result<Self, MatchError> {
        let mut profiles = HashMap::with_capacity(settings.len());
        for s in settings {
            let profile = EngineProfile::from_settings(s)?;
            if profiles.insert(profile.name.clone(), profile).is_some() {
                return Err(MatchError::Configuration(format!(
                    "profile '{}' is declared twice",
                    s.name
                )));
            }
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Result<&EngineProfile, MatchError> {
        self.profiles.get(name).ok_or_else(|| {
            MatchError::Configuration(format!("no engine profile named '{}'", name))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_build() {
        let registry = ProfileRegistry::from_settings(&ProfileSettings::builtin()).unwrap();
        assert_eq!(
            registry.names(),
            vec![EXCHANGE_LEDGER, GENERIC, LEDGER_EXCHANGE]
        );

        let le = registry.get(LEDGER_EXCHANGE).unwrap();
        let el = registry.get(EXCHANGE_LEDGER).unwrap();
        assert_eq!(le.adapter(Side::A).source(), "ledger");
        assert_eq!(el.adapter(Side::A).source(), "exchange");
        // The two pairings assign roles in opposite directions.
        assert_ne!(le.params.roles, el.params.roles);
    }

    #[test]
    fn unknown_profile_is_configuration_error() {
        let registry = ProfileRegistry::from_settings(&ProfileSettings::builtin()).unwrap();
        assert!(matches!(
            registry.get("crypto"),
            Err(MatchError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let mut settings = ProfileSettings::builtin().remove(0);
        settings.time_window_secs = 0;
        assert!(matches!(
            EngineProfile::from_settings(&settings),
            Err(MatchError::Configuration(_))
        ));

        let mut settings = ProfileSettings::builtin().remove(0);
        settings.amount_tolerance = Decimal::new(-1, 2);
        assert!(EngineProfile::from_settings(&settings).is_err());
    }

    #[test]
    fn oversized_time_window_is_configuration_error() {
        let mut settings = ProfileSettings::builtin().remove(0);
        settings.time_window_secs = i64::MAX;
        assert!(matches!(
            EngineProfile::from_settings(&settings),
            Err(MatchError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_and_self_pairings_are_rejected() {
        let mut all = ProfileSettings::builtin();
        all.push(all[0].clone());
        assert!(ProfileRegistry::from_settings(&all).is_err());

        let mut settings = ProfileSettings::builtin().remove(2);
        settings.side_b.source = settings.side_a.source.clone();
        assert!(EngineProfile::from_settings(&settings).is_err());
    }
}
