use crate::common::DimSize;
use crate::schedule::{IterVar, ScheduleError, Stage};
use crate::utils::{factors, join_into_string, power_of_two_factors};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// How the candidate factors of a [SplitSpace] are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SplitPolicy {
    /// Every divisor of the extent.
    #[default]
    Factors,
    /// Powers of two which divide the extent.
    PowerOf2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOptions {
    pub num_outputs: usize,
    pub policy: SplitPolicy,
    /// Upper bound for every factor except the outermost.
    pub max_factor: Option<DimSize>,
}

/// One way to tile an axis: factors, outermost first, whose product is the
/// axis extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitEntity {
    pub size: SmallVec<[DimSize; 4]>,
}

/// All candidate tilings of one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSpace {
    pub extent: DimSize,
    pub options: SplitOptions,
    pub entities: Vec<SplitEntity>,
}

/// Tunable knobs of a template, in definition order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSpace {
    knobs: IndexMap<String, SplitSpace>,
}

/// A single point of a [ConfigSpace].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntity {
    pub index: u64,
    pub entities: IndexMap<String, SplitEntity>,
}

/// The handle a template uses to declare and read its knobs.
#[derive(Debug)]
pub enum Config {
    /// Collecting knob definitions. Reads answer each knob's first candidate.
    Space(ConfigSpace),
    /// Replaying a concrete configuration.
    Entity(ConfigEntity),
    /// No tuned configuration is known; every knob uses its first candidate.
    Fallback(ConfigSpace),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SpaceError {
    #[error("Knob {0} is not defined")]
    UnknownKnob(String),
    #[error("Knob {name} was already defined with extent {existing}, not {requested}")]
    KnobRedefined {
        name: String,
        existing: DimSize,
        requested: DimSize,
    },
    #[error("Knob {0} has no candidates")]
    EmptyKnob(String),
    #[error("Index {index} is out of range for a space of {len} configurations")]
    IndexOutOfRange { index: u64, len: u64 },
    #[error("Split of {name} needs at least one output")]
    NoOutputs { name: String },
}

impl Default for SplitOptions {
    fn default() -> Self {
        SplitOptions {
            num_outputs: 2,
            policy: SplitPolicy::Factors,
            max_factor: None,
        }
    }
}

impl SplitOptions {
    pub fn with_outputs(num_outputs: usize) -> Self {
        SplitOptions {
            num_outputs,
            ..Default::default()
        }
    }
}

impl SplitSpace {
    pub fn new(extent: DimSize, options: SplitOptions) -> Self {
        let candidates = match options.policy {
            SplitPolicy::Factors => factors(extent),
            SplitPolicy::PowerOf2 => power_of_two_factors(extent),
        }
        .into_iter()
        .filter(|f| options.max_factor.map_or(true, |m| *f <= m))
        .collect::<Vec<_>>();

        let mut entities = vec![];
        let mut inner = SmallVec::<[DimSize; 4]>::new();
        enumerate_splits(
            extent,
            options.num_outputs.saturating_sub(1),
            &candidates,
            &mut inner,
            &mut entities,
        );
        SplitSpace {
            extent,
            options,
            entities,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Pushes, for every assignment of `remaining` inner factors from
/// `candidates` whose product divides `extent`, the entity with the quotient
/// prepended as the outermost factor.
fn enumerate_splits(
    extent: DimSize,
    remaining: usize,
    candidates: &[DimSize],
    inner: &mut SmallVec<[DimSize; 4]>,
    out: &mut Vec<SplitEntity>,
) {
    if remaining == 0 {
        let mut size = SmallVec::with_capacity(inner.len() + 1);
        size.push(extent);
        size.extend(inner.iter().rev().copied());
        out.push(SplitEntity { size });
        return;
    }
    for &f in candidates {
        if extent % f != 0 {
            continue;
        }
        inner.push(f);
        enumerate_splits(extent / f, remaining - 1, candidates, inner, out);
        inner.pop();
    }
}

impl SplitEntity {
    /// Splits `axis` of `stage` into `size.len()` nested loops, returned
    /// outermost first.
    pub fn apply(&self, stage: &mut Stage, axis: IterVar) -> Result<Vec<IterVar>, ScheduleError> {
        let mut result = Vec::with_capacity(self.size.len());
        let mut remaining = axis;
        for &factor in self.size[1..].iter().rev() {
            let (outer, inner) = stage.split(remaining, factor)?;
            result.push(inner);
            remaining = outer;
        }
        result.push(remaining);
        result.reverse();
        Ok(result)
    }
}

impl fmt::Display for SplitEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp[{}]", join_into_string(&self.size, ", "))
    }
}

impl ConfigSpace {
    pub fn define_split(
        &mut self,
        name: &str,
        extent: DimSize,
        options: SplitOptions,
    ) -> Result<(), SpaceError> {
        if options.num_outputs == 0 {
            return Err(SpaceError::NoOutputs {
                name: name.to_owned(),
            });
        }
        if let Some(existing) = self.knobs.get(name) {
            if existing.extent != extent || existing.options != options {
                return Err(SpaceError::KnobRedefined {
                    name: name.to_owned(),
                    existing: existing.extent,
                    requested: extent,
                });
            }
            return Ok(());
        }
        let space = SplitSpace::new(extent, options);
        if space.is_empty() {
            return Err(SpaceError::EmptyKnob(name.to_owned()));
        }
        self.knobs.insert(name.to_owned(), space);
        Ok(())
    }

    pub fn knobs(&self) -> impl Iterator<Item = (&str, &SplitSpace)> {
        self.knobs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn knob(&self, name: &str) -> Option<&SplitSpace> {
        self.knobs.get(name)
    }

    /// Number of configurations: the product of every knob's candidate count.
    pub fn len(&self) -> u64 {
        self.knobs.values().map(|k| k.len() as u64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes `index` as a mixed-radix number, the first knob being the least
    /// significant digit.
    pub fn get(&self, index: u64) -> Result<ConfigEntity, SpaceError> {
        let len = self.len();
        if index >= len {
            return Err(SpaceError::IndexOutOfRange { index, len });
        }
        Ok(self.entity_from_choices(index, &self.choices(index)))
    }

    /// Per-knob candidate indices of a flat index.
    pub fn choices(&self, index: u64) -> Vec<usize> {
        let mut t = index;
        self.knobs
            .values()
            .map(|k| {
                let n = k.len() as u64;
                let c = (t % n) as usize;
                t /= n;
                c
            })
            .collect()
    }

    /// The flat index of per-knob candidate indices.
    pub fn index_of(&self, choices: &[usize]) -> u64 {
        debug_assert_eq!(choices.len(), self.knobs.len());
        let mut index = 0u64;
        let mut radix = 1u64;
        for (k, &c) in self.knobs.values().zip(choices) {
            index += radix * c as u64;
            radix *= k.len() as u64;
        }
        index
    }

    /// Sizes of every knob, in definition order.
    pub fn dims(&self) -> Vec<usize> {
        self.knobs.values().map(|k| k.len()).collect()
    }

    fn entity_from_choices(&self, index: u64, choices: &[usize]) -> ConfigEntity {
        ConfigEntity {
            index,
            entities: self
                .knobs
                .iter()
                .zip(choices)
                .map(|((name, k), &c)| (name.clone(), k.entities[c].clone()))
                .collect(),
        }
    }
}

impl fmt::Display for ConfigSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ConfigSpace (len={}, space_map=", self.len())?;
        for (i, (name, k)) in self.knobs.iter().enumerate() {
            writeln!(
                f,
                "   {i:2} {name}: Split(policy={:?}, extent={}, num_outputs={}) len={}",
                k.options.policy,
                k.extent,
                k.options.num_outputs,
                k.len()
            )?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ConfigEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}],None,{}",
            join_into_string(
                self.entities
                    .iter()
                    .map(|(name, e)| format!("('{name}', {e})")),
                ", "
            ),
            self.index
        )
    }
}

impl Config {
    pub fn define_split(
        &mut self,
        name: &str,
        extent: DimSize,
        options: SplitOptions,
    ) -> Result<(), SpaceError> {
        match self {
            Config::Space(space) | Config::Fallback(space) => {
                space.define_split(name, extent, options)
            }
            Config::Entity(entity) => {
                if entity.entities.contains_key(name) {
                    Ok(())
                } else {
                    Err(SpaceError::UnknownKnob(name.to_owned()))
                }
            }
        }
    }

    /// The tiling chosen for knob `name`.
    pub fn split(&self, name: &str) -> Result<&SplitEntity, SpaceError> {
        match self {
            Config::Space(space) | Config::Fallback(space) => space
                .knob(name)
                .and_then(|k| k.entities.first())
                .ok_or_else(|| SpaceError::UnknownKnob(name.to_owned())),
            Config::Entity(entity) => entity
                .entities
                .get(name)
                .ok_or_else(|| SpaceError::UnknownKnob(name.to_owned())),
        }
    }

    pub fn into_space(self) -> Option<ConfigSpace> {
        match self {
            Config::Space(space) => Some(space),
            Config::Entity(_) | Config::Fallback(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;
    use crate::workloads::batch_matmul;
    use proptest::prelude::*;
    use smallvec::smallvec;

    #[test]
    fn test_two_way_split_of_twelve() {
        let space = SplitSpace::new(12, SplitOptions::default());
        let sizes = space
            .entities
            .iter()
            .map(|e| e.size.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(
            sizes,
            vec![
                vec![12, 1],
                vec![6, 2],
                vec![4, 3],
                vec![3, 4],
                vec![2, 6],
                vec![1, 12]
            ]
        );
    }

    #[test]
    fn test_power_of_two_policy_with_max_factor() {
        let space = SplitSpace::new(
            24,
            SplitOptions {
                num_outputs: 2,
                policy: SplitPolicy::PowerOf2,
                max_factor: Some(4),
            },
        );
        let inner = space.entities.iter().map(|e| e.size[1]).collect::<Vec<_>>();
        assert_eq!(inner, vec![1, 2, 4]);
    }

    #[test]
    fn test_mixed_radix_index_first_knob_least_significant() {
        let mut space = ConfigSpace::default();
        space.define_split("a", 4, SplitOptions::default()).unwrap(); // 3 candidates
        space.define_split("b", 2, SplitOptions::default()).unwrap(); // 2 candidates
        assert_eq!(space.len(), 6);
        assert_eq!(space.choices(4), vec![1, 1]);
        assert_eq!(space.index_of(&[1, 1]), 4);
        let e = space.get(4).unwrap();
        assert_eq!(e.entities["a"].size.to_vec(), vec![2, 2]);
        assert_eq!(e.entities["b"].size.to_vec(), vec![1, 2]);
        assert_eq!(
            space.get(6),
            Err(SpaceError::IndexOutOfRange { index: 6, len: 6 })
        );
    }

    #[test]
    fn test_redefining_knob_with_other_extent_fails() {
        let mut space = ConfigSpace::default();
        space.define_split("a", 4, SplitOptions::default()).unwrap();
        space.define_split("a", 4, SplitOptions::default()).unwrap();
        assert!(matches!(
            space.define_split("a", 8, SplitOptions::default()),
            Err(SpaceError::KnobRedefined { .. })
        ));
    }

    #[test]
    fn test_config_modes() {
        let mut cfg = Config::Space(ConfigSpace::default());
        cfg.define_split("k", 8, SplitOptions::default()).unwrap();
        assert_eq!(cfg.split("k").unwrap().size.to_vec(), vec![8, 1]);
        assert_eq!(
            cfg.split("missing"),
            Err(SpaceError::UnknownKnob("missing".to_owned()))
        );
        let space = cfg.into_space().unwrap();

        let mut cfg = Config::Entity(space.get(2).unwrap());
        cfg.define_split("k", 8, SplitOptions::default()).unwrap();
        assert_eq!(cfg.split("k").unwrap().size.to_vec(), vec![2, 4]);
        assert!(cfg.define_split("other", 8, SplitOptions::default()).is_err());
    }

    #[test]
    fn test_entity_apply_returns_outermost_first() {
        let (ops, bufs) = batch_matmul(&[1, 24, 2, 2]).unwrap();
        let mut s = Schedule::create(&ops);
        let stage = s.stage_mut(&bufs[2]).unwrap();
        let y = stage.axis()[1];
        let entity = SplitEntity {
            size: smallvec![2, 3, 4],
        };
        let axes = entity.apply(stage, y).unwrap();
        assert_eq!(axes.len(), 3);
        assert_eq!(
            axes.iter().map(|&a| stage.extent(a)).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(stage.name(axes[0]), "y.outer.outer");
        assert_eq!(stage.name(axes[2]), "y.inner");
    }

    #[test]
    fn test_config_entity_display() {
        let mut space = ConfigSpace::default();
        space.define_split("tile_x", 4, SplitOptions::default()).unwrap();
        let e = space.get(1).unwrap();
        assert_eq!(e.to_string(), "[('tile_x', sp[2, 2])],None,1");
    }

    proptest! {
        #[test]
        fn test_split_entities_multiply_to_extent(
            extent in 1u32..512,
            outputs in 1usize..4,
            policy in any::<SplitPolicy>(),
        ) {
            let options = SplitOptions {
                policy,
                ..SplitOptions::with_outputs(outputs)
            };
            let space = SplitSpace::new(extent, options);
            prop_assert!(!space.is_empty());
            for e in &space.entities {
                prop_assert_eq!(e.size.len(), outputs);
                prop_assert_eq!(e.size.iter().product::<u32>(), extent);
            }
        }

        #[test]
        fn test_index_roundtrips_through_choices(a in 1u32..64, b in 1u32..64, seed in any::<u64>()) {
            let mut space = ConfigSpace::default();
            space.define_split("a", a, SplitOptions::default()).unwrap();
            space.define_split("b", b, SplitOptions::default()).unwrap();
            let index = seed % space.len();
            prop_assert_eq!(space.index_of(&space.choices(index)), index);
        }
    }
}
