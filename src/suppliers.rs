// src/suppliers.rs
//
// Value suppliers and the context producers composed from them. A field
// supplier is not a closure: producers are a closed set of variants with a
// uniform apply(context) operation, so later producers can observe what
// earlier ones wrote without carrying hidden state.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::objects::{self, ObjectManager};
use crate::request::{keys, Context, Credential};
use crate::size_generator::SizeGenerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cycle,
    Random,
}

/// Produces one string value per call.
pub enum ValueSupplier {
    Constant(String),
    Cycle {
        values: Vec<String>,
        next: usize,
    },
    Random {
        values: Vec<String>,
        rng: StdRng,
    },
    Ranged {
        min: u64,
        max: u64,
        mode: Mode,
        next: u64,
        rng: StdRng,
    },
    Weighted {
        choices: Vec<(String, f64)>,
        total: f64,
        rng: StdRng,
    },
}

impl ValueSupplier {
    pub fn constant(value: impl Into<String>) -> ValueSupplier {
        ValueSupplier::Constant(value.into())
    }

    pub fn cycle(values: Vec<String>) -> Result<ValueSupplier> {
        anyhow::ensure!(!values.is_empty(), "cycle supplier requires at least one value");
        Ok(ValueSupplier::Cycle { values, next: 0 })
    }

    pub fn random(values: Vec<String>) -> Result<ValueSupplier> {
        anyhow::ensure!(!values.is_empty(), "random supplier requires at least one value");
        Ok(ValueSupplier::Random {
            values,
            rng: StdRng::seed_from_u64(rand::random()),
        })
    }

    pub fn ranged(min: u64, max: u64, mode: Mode) -> Result<ValueSupplier> {
        anyhow::ensure!(min <= max, "ranged supplier: min ({}) > max ({})", min, max);
        Ok(ValueSupplier::Ranged {
            min,
            max,
            mode,
            next: min,
            rng: StdRng::seed_from_u64(rand::random()),
        })
    }

    pub fn weighted(choices: Vec<(String, f64)>) -> Result<ValueSupplier> {
        anyhow::ensure!(!choices.is_empty(), "weighted supplier requires choices");
        for (value, weight) in &choices {
            anyhow::ensure!(
                weight.is_finite() && *weight >= 0.0,
                "weighted supplier: bad weight {} for [{}]",
                weight,
                value
            );
        }
        let total: f64 = choices.iter().map(|(_, w)| w).sum();
        anyhow::ensure!(total > 0.0, "weighted supplier: weights sum to zero");
        Ok(ValueSupplier::Weighted {
            choices,
            total,
            rng: StdRng::seed_from_u64(rand::random()),
        })
    }

    pub fn get(&mut self) -> String {
        match self {
            ValueSupplier::Constant(v) => v.clone(),
            ValueSupplier::Cycle { values, next } => {
                let v = values[*next].clone();
                *next = (*next + 1) % values.len();
                v
            }
            ValueSupplier::Random { values, rng } => {
                values[rng.random_range(0..values.len())].clone()
            }
            ValueSupplier::Ranged {
                min,
                max,
                mode,
                next,
                rng,
            } => match mode {
                Mode::Cycle => {
                    let v = *next;
                    *next = if v >= *max { *min } else { v + 1 };
                    v.to_string()
                }
                Mode::Random => rng.random_range(*min..=*max).to_string(),
            },
            ValueSupplier::Weighted {
                choices,
                total,
                rng,
            } => {
                let mut roll = rng.random_range(0.0..*total);
                for (value, weight) in choices.iter() {
                    if roll < *weight {
                        return value.clone();
                    }
                    roll -= weight;
                }
                // floating point edge: fall back to the final choice
                choices[choices.len() - 1].0.clone()
            }
        }
    }
}

/// Where object names come from for a given operation.
pub enum ObjectNameSource {
    /// Fresh random name (writes).
    Generate,
    /// Non-exclusive checkout of an existing name (reads, head, overwrite).
    ForRead(Arc<ObjectManager>),
    /// Exclusive checkout (deletes).
    ForDelete(Arc<ObjectManager>),
}

/// The closed set of per-request context producers. Evaluated in order;
/// each may read what earlier producers wrote.
pub enum ContextProducer {
    RequestId {
        next: u64,
    },
    ObjectName(ObjectNameSource),
    ContainerName {
        base: ValueSupplier,
        suffix: Option<ValueSupplier>,
    },
    ObjectSize(SizeGenerator),
    Credentials {
        accounts: Vec<Credential>,
        next: usize,
    },
    StorageAccount(ValueSupplier),
    Retention(ValueSupplier),
    LegalHold(ValueSupplier),
    /// Opaque pass-through for keys the pipeline does not interpret.
    Value {
        key: String,
        supplier: ValueSupplier,
    },
}

impl ContextProducer {
    pub fn apply(&mut self, ctx: &mut Context) -> Result<()> {
        match self {
            ContextProducer::RequestId { next } => {
                *next += 1;
                ctx.insert(keys::REQUEST_ID.to_string(), next.to_string());
            }
            ContextProducer::ObjectName(source) => {
                let name = match source {
                    ObjectNameSource::Generate => objects::random_name(),
                    ObjectNameSource::ForRead(manager) => manager
                        .get_name_for_read()
                        .context("no object available for read")?,
                    ObjectNameSource::ForDelete(manager) => manager
                        .get_name_for_delete()
                        .context("no object available for delete")?,
                };
                ctx.insert(keys::OBJECT_NAME.to_string(), name);
            }
            ContextProducer::ContainerName { base, suffix } => {
                let prefix = base.get();
                ctx.insert(keys::CONTAINER_PREFIX.to_string(), prefix.clone());
                let name = match suffix {
                    Some(supplier) => {
                        let suffix = supplier.get();
                        ctx.insert(keys::CONTAINER_SUFFIX.to_string(), suffix.clone());
                        format!("{}{}", prefix, suffix)
                    }
                    None => prefix,
                };
                ctx.insert(keys::CONTAINER_NAME.to_string(), name);
            }
            ContextProducer::ObjectSize(generator) => {
                ctx.insert(keys::OBJECT_SIZE.to_string(), generator.generate().to_string());
            }
            ContextProducer::Credentials { accounts, next } => {
                if accounts.is_empty() {
                    return Err(anyhow!("credential supplier has no accounts"));
                }
                let credential = &accounts[*next % accounts.len()];
                *next = (*next + 1) % accounts.len();
                if let Some(username) = &credential.username {
                    ctx.insert(keys::USERNAME.to_string(), username.clone());
                }
                if let Some(password) = &credential.password {
                    ctx.insert(keys::PASSWORD.to_string(), password.clone());
                }
                if let Some(token) = &credential.keystone_token {
                    ctx.insert(keys::KEYSTONE_TOKEN.to_string(), token.clone());
                }
                if let Some(account) = &credential.storage_account_name {
                    ctx.insert(keys::STORAGE_ACCOUNT_NAME.to_string(), account.clone());
                }
            }
            ContextProducer::StorageAccount(supplier) => {
                ctx.insert(keys::STORAGE_ACCOUNT_NAME.to_string(), supplier.get());
            }
            ContextProducer::Retention(supplier) => {
                ctx.insert(keys::OBJECT_RETENTION.to_string(), supplier.get());
            }
            ContextProducer::LegalHold(supplier) => {
                ctx.insert(keys::LEGAL_HOLD.to_string(), supplier.get());
            }
            ContextProducer::Value { key, supplier } => {
                ctx.insert(key.clone(), supplier.get());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn constant_forever() {
        let mut s = ValueSupplier::constant("vault-0");
        for _ in 0..10 {
            assert_eq!(s.get(), "vault-0");
        }
    }

    #[test]
    fn cycle_rotates_deterministically() {
        let mut s =
            ValueSupplier::cycle(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        let seq: Vec<String> = (0..7).map(|_| s.get()).collect();
        assert_eq!(seq, ["a", "b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn ranged_cycle_wraps_inclusive() {
        let mut s = ValueSupplier::ranged(3, 5, Mode::Cycle).unwrap();
        let seq: Vec<String> = (0..5).map(|_| s.get()).collect();
        assert_eq!(seq, ["3", "4", "5", "3", "4"]);
    }

    #[test]
    fn ranged_random_stays_in_bounds() {
        let mut s = ValueSupplier::ranged(10, 20, Mode::Random).unwrap();
        for _ in 0..1000 {
            let v: u64 = s.get().parse().unwrap();
            assert!((10..=20).contains(&v));
        }
    }

    #[test]
    fn ranged_rejects_inverted_bounds() {
        assert!(ValueSupplier::ranged(5, 4, Mode::Cycle).is_err());
    }

    #[test]
    fn weighted_rejects_zero_total() {
        assert!(ValueSupplier::weighted(vec![("a".into(), 0.0)]).is_err());
        assert!(ValueSupplier::weighted(vec![]).is_err());
    }

    #[test]
    fn weighted_empirical_frequency_tracks_weights() {
        let mut s = ValueSupplier::weighted(vec![
            ("write".into(), 1.0),
            ("read".into(), 3.0),
            ("delete".into(), 1.0),
        ])
        .unwrap();
        let draws = 1_000_000;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(s.get()).or_insert(0) += 1;
        }
        let read = counts["read"] as f64 / draws as f64;
        assert!((read - 0.6).abs() < 0.01, "read frequency {}", read);
        let write = counts["write"] as f64 / draws as f64;
        assert!((write - 0.2).abs() < 0.01, "write frequency {}", write);
    }

    #[test]
    fn producers_fill_the_context_in_order() {
        let mut ctx = Context::new();
        let mut producers = vec![
            ContextProducer::RequestId { next: 0 },
            ContextProducer::ContainerName {
                base: ValueSupplier::constant("vault-"),
                suffix: Some(ValueSupplier::ranged(0, 0, Mode::Cycle).unwrap()),
            },
            ContextProducer::ObjectName(ObjectNameSource::Generate),
            ContextProducer::Credentials {
                accounts: vec![Credential::basic("user", "secret")],
                next: 0,
            },
        ];
        for p in &mut producers {
            p.apply(&mut ctx).unwrap();
        }
        assert_eq!(ctx[keys::REQUEST_ID], "1");
        assert_eq!(ctx[keys::CONTAINER_NAME], "vault-0");
        assert_eq!(ctx[keys::USERNAME], "user");
        assert_eq!(ctx[keys::OBJECT_NAME].len(), 32);
    }

    #[test]
    fn empty_population_error_is_preserved_through_apply() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ObjectManager::load(dir.path(), "og").unwrap());
        let mut producer = ContextProducer::ObjectName(ObjectNameSource::ForRead(manager));
        let err = producer.apply(&mut Context::new()).unwrap_err();
        assert!(err
            .downcast_ref::<crate::objects::EmptyPopulation>()
            .is_some());
    }
}
