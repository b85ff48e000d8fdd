use crate::schedule::Schedule;
use crate::space::{Config, ConfigEntity, ConfigSpace};
use crate::target::TargetId;
use crate::template::{Template, TemplateError};
use crate::tensor::Tensor;
use crate::utils::join_into_string;

use std::fmt;
use std::sync::Arc;

/// A [Template] registered for tuning on one target.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub args: Vec<i64>,
    pub target: TargetId,
    pub config_space: ConfigSpace,
    /// Floating-point operations of one run, used to report GFLOPS.
    pub flop: f64,
    template: Arc<dyn Template>,
}

impl Task {
    /// Registers `template`, collecting its configuration space.
    pub fn create(
        template: Arc<dyn Template>,
        args: &[i64],
        target: TargetId,
    ) -> Result<Self, TemplateError> {
        let mut cfg = Config::Space(ConfigSpace::default());
        let (schedule, _) = template.instantiate(&mut cfg)?;
        let config_space = cfg.into_space().unwrap_or_default();
        let flop = schedule.stages().iter().map(|s| s.op().flop()).sum();
        Ok(Task {
            name: template.name().to_owned(),
            args: args.to_vec(),
            target,
            config_space,
            flop,
            template,
        })
    }

    pub fn instantiate(
        &self,
        config: &ConfigEntity,
    ) -> Result<(Schedule, Vec<Tensor>), TemplateError> {
        self.template
            .instantiate(&mut Config::Entity(config.clone()))
    }

    /// Instantiates with the first candidate of every knob.
    pub fn instantiate_fallback(&self) -> Result<(Schedule, Vec<Tensor>), TemplateError> {
        self.template
            .instantiate(&mut Config::Fallback(ConfigSpace::default()))
    }

    /// Identifies the workload in tuning logs.
    pub fn workload_key(&self) -> String {
        workload_key(&self.name, &self.args)
    }
}

pub(crate) fn workload_key(name: &str, args: &[i64]) -> String {
    format!("{name}({})", join_into_string(args, ", "))
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("target", &self.target)
            .field("space_len", &self.config_space.len())
            .field("flop", &self.flop)
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task(target={}, workload={})", self.target, self.workload_key())
    }
}
