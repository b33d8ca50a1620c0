//! Matrix expansion: one concrete job per combination of axis values.
//!
//! Axes are independent, so the expansion is the full Cartesian product.
//! [`Matrix::combinations`] yields combinations lazily and can be restarted
//! by calling it again (or cloning the iterator).

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::domain::job::{ConcreteJob, JobSpec, StepSpec};
use crate::template;

/// Malformed matrix definitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("matrix axis name must not be empty")]
    EmptyAxisName,

    #[error("matrix axis '{axis}' has no values")]
    EmptyAxis { axis: String },

    #[error("matrix axis '{axis}' lists value '{value}' more than once")]
    DuplicateValue { axis: String, value: String },

    #[error("placeholder references unknown matrix axis '{axis}'")]
    UnknownAxis { axis: String },
}

/// A named dimension with an enumerated value set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixAxis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn validate(&self) -> Result<(), MatrixError> {
        if self.name.trim().is_empty() {
            return Err(MatrixError::EmptyAxisName);
        }
        if self.values.is_empty() {
            return Err(MatrixError::EmptyAxis {
                axis: self.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        for value in &self.values {
            if !seen.insert(value.as_str()) {
                return Err(MatrixError::DuplicateValue {
                    axis: self.name.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A validated set of axes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matrix {
    axes: Vec<MatrixAxis>,
}

impl Matrix {
    pub fn new(axes: Vec<MatrixAxis>) -> Result<Self, MatrixError> {
        for axis in &axes {
            axis.validate()?;
        }
        Ok(Self { axes })
    }

    /// Build from the `matrix` table of a job (axes in name order).
    pub fn from_table(table: &BTreeMap<String, Vec<String>>) -> Result<Self, MatrixError> {
        Self::new(
            table
                .iter()
                .map(|(name, values)| MatrixAxis::new(name.clone(), values.iter().cloned()))
                .collect(),
        )
    }

    pub fn axes(&self) -> &[MatrixAxis] {
        &self.axes
    }

    pub fn has_axis(&self, name: &str) -> bool {
        self.axes.iter().any(|a| a.name == name)
    }

    /// Number of combinations (1 for a matrix with no axes).
    pub fn len(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn combinations(&self) -> Combinations<'_> {
        Combinations {
            axes: &self.axes,
            indices: vec![0; self.axes.len()],
            remaining: self.len(),
        }
    }
}

/// Lazy iterator over axis-value combinations (odometer order, last axis
/// varies fastest).
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    axes: &'a [MatrixAxis],
    indices: Vec<usize>,
    remaining: usize,
}

impl Iterator for Combinations<'_> {
    type Item = BTreeMap<String, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let combo = self
            .axes
            .iter()
            .zip(&self.indices)
            .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
            .collect();

        self.remaining -= 1;
        for pos in (0..self.indices.len()).rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < self.axes[pos].values.len() {
                break;
            }
            self.indices[pos] = 0;
        }
        Some(combo)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Combinations<'_> {}

/// Instance id for a template and combination: `name (v1, v2)`.
pub fn instance_id(template: &str, combo: &BTreeMap<String, String>) -> String {
    if combo.is_empty() {
        return template.to_string();
    }
    let values: Vec<&str> = combo.values().map(String::as_str).collect();
    format!("{template} ({})", values.join(", "))
}

/// Replace `${{ matrix.<axis> }}` placeholders with the combination's values.
pub fn substitute(input: &str, combo: &BTreeMap<String, String>) -> Result<String, MatrixError> {
    template::replace_scope(input, "matrix", |key| combo.get(key).cloned())
        .map_err(|axis| MatrixError::UnknownAxis { axis })
}

fn substitute_map(
    map: &BTreeMap<String, String>,
    combo: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, MatrixError> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), substitute(v, combo)?)))
        .collect()
}

fn substitute_step(
    step: &StepSpec,
    combo: &BTreeMap<String, String>,
) -> Result<StepSpec, MatrixError> {
    let run = match &step.run {
        Some(argv) => Some(
            argv.iter()
                .map(|arg| substitute(arg, combo))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };
    let uses = match &step.uses {
        Some(action) => Some(
            action
                .map_parameters(|p| {
                    template::replace_scope(p, "matrix", |key| combo.get(key).cloned())
                })
                .map_err(|axis| MatrixError::UnknownAxis { axis })?,
        ),
        None => None,
    };
    Ok(StepSpec {
        name: substitute(&step.name, combo)?,
        run,
        uses,
        env: substitute_map(&step.env, combo)?,
        condition: step.condition.clone(),
        timeout_secs: step.timeout_secs,
    })
}

/// Expands job templates into concrete instances.
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand `job` (registered under `template_id`) into one [`ConcreteJob`]
    /// per combination. Jobs without axes produce a single instance.
    pub fn expand(template_id: &str, job: &JobSpec) -> Result<Vec<ConcreteJob>, MatrixError> {
        let matrix = Matrix::from_table(&job.matrix)?;
        matrix
            .combinations()
            .map(|combo| Self::instantiate(template_id, job, combo))
            .collect()
    }

    fn instantiate(
        template_id: &str,
        job: &JobSpec,
        combo: BTreeMap<String, String>,
    ) -> Result<ConcreteJob, MatrixError> {
        let steps = job
            .steps
            .iter()
            .map(|s| substitute_step(s, &combo))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ConcreteJob {
            id: instance_id(template_id, &combo),
            template: template_id.to_string(),
            runs_on: substitute(&job.runs_on, &combo)?,
            needs: job.needs.clone(),
            condition: job.condition.clone(),
            env: substitute_map(&job.env, &combo)?,
            secrets: job.secrets.clone(),
            role: job.role,
            timeout_minutes: job.timeout_minutes,
            steps,
            matrix: combo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_tests_job() -> JobSpec {
        JobSpec::new(vec![StepSpec::run(
            "pytest",
            ["pytest", "--python", "${{ matrix.python }}", "${{ matrix.group }}"],
        )
        .with_env("GROUP", "${{ matrix.group }}")])
        .with_axis("python", ["3.7", "3.8", "3.9", "3.10"])
        .with_axis("group", ["test", "mock_tests"])
        .with_needs(["lint"])
    }

    #[test]
    fn test_expansion_is_full_cartesian_product() {
        let jobs = MatrixExpander::expand("unit-tests", &unit_tests_job()).unwrap();
        assert_eq!(jobs.len(), 8);

        let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids.len(), 8, "every instance id must be unique");

        let combos: HashSet<Vec<(String, String)>> = jobs
            .iter()
            .map(|j| j.matrix.clone().into_iter().collect())
            .collect();
        assert_eq!(combos.len(), 8);
    }

    #[test]
    fn test_instances_inherit_needs_and_substitute_values() {
        let jobs = MatrixExpander::expand("unit-tests", &unit_tests_job()).unwrap();
        for job in &jobs {
            assert_eq!(job.needs, vec!["lint".to_string()]);
            let argv = job.steps[0].run.as_ref().unwrap();
            assert_eq!(argv[2], job.matrix["python"]);
            assert_eq!(argv[3], job.matrix["group"]);
            assert_eq!(job.steps[0].env["GROUP"], job.matrix["group"]);
        }
    }

    #[test]
    fn test_combinations_are_restartable_and_sized() {
        let matrix = Matrix::new(vec![
            MatrixAxis::new("a", ["1", "2", "3"]),
            MatrixAxis::new("b", ["x", "y"]),
        ])
        .unwrap();
        let iter = matrix.combinations();
        assert_eq!(iter.len(), 6);
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = matrix.combinations().collect();
        assert_eq!(first, second);
        assert_eq!(first[0]["a"], "1");
        assert_eq!(first[0]["b"], "x");
        assert_eq!(first[1]["b"], "y");
    }

    #[test]
    fn test_no_axes_yields_single_instance() {
        let job = JobSpec::new(vec![StepSpec::run("lint", ["flake8"])]);
        let jobs = MatrixExpander::expand("lint", &job).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "lint");
        assert!(jobs[0].matrix.is_empty());
    }

    #[test]
    fn test_malformed_axes_rejected() {
        let job = JobSpec::new(vec![StepSpec::run("t", ["true"])]).with_axis("python", Vec::<String>::new());
        assert_eq!(
            MatrixExpander::expand("t", &job),
            Err(MatrixError::EmptyAxis {
                axis: "python".to_string()
            })
        );

        let job = JobSpec::new(vec![StepSpec::run("t", ["true"])]).with_axis("python", ["3.9", "3.9"]);
        assert!(matches!(
            MatrixExpander::expand("t", &job),
            Err(MatrixError::DuplicateValue { .. })
        ));
    }

    #[test]
    fn test_unknown_axis_placeholder_rejected() {
        let job = JobSpec::new(vec![StepSpec::run("t", ["echo", "${{ matrix.os }}"])])
            .with_axis("python", ["3.9"]);
        assert_eq!(
            MatrixExpander::expand("t", &job),
            Err(MatrixError::UnknownAxis {
                axis: "os".to_string()
            })
        );
    }

    #[test]
    fn test_instance_id_format() {
        let combo = BTreeMap::from([
            ("group".to_string(), "test".to_string()),
            ("python".to_string(), "3.10".to_string()),
        ]);
        assert_eq!(instance_id("unit-tests", &combo), "unit-tests (test, 3.10)");
    }
}
