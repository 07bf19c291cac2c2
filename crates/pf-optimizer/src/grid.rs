//! Two-parameter grid search.
//!
//! The declared uniform ranges of two parameters are cut into `steps` equal
//! bins each, and every one of the `steps²` cells is fitted independently
//! with its axes restricted to the cell. Cells run concurrently on a
//! bounded worker pool.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use pf_types::{config_error, internal_error, FitResult, Model, ParamPath, PfResult, Prior};

use crate::boundary::{CallContext, OptimizerSettings};
use crate::events::PipelineEventKind;
use crate::trial::Attempt;

/// Which two parameters to partition and how finely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub param_a: ParamPath,
    pub param_b: ParamPath,
    pub steps: usize,
}

impl GridSpec {
    pub fn new(param_a: ParamPath, param_b: ParamPath, steps: usize) -> Self {
        Self {
            param_a,
            param_b,
            steps,
        }
    }

    /// Checks that do not depend on the model.
    pub fn check_shape(&self) -> PfResult<()> {
        if self.steps == 0 {
            return Err(config_error!("grid needs at least one step per axis"));
        }
        if self.param_a == self.param_b {
            return Err(config_error!(
                "grid axes must be two different parameters, got {} twice",
                self.param_a
            ));
        }
        Ok(())
    }

    /// Check the grid shape against the model the cells are cut from and return
    /// the two axis ranges.
    pub fn axes(&self, model: &Model) -> PfResult<((f64, f64), (f64, f64))> {
        self.check_shape()?;
        Ok((axis_range(model, &self.param_a)?, axis_range(model, &self.param_b)?))
    }

    /// Cut the model's axis ranges into cells, row-major over `(i, j)`.
    pub fn cells(&self, model: &Model) -> PfResult<Vec<Cell>> {
        let (range_a, range_b) = self.axes(model)?;
        let edges_a = edges(&self.param_a, range_a, self.steps)?;
        let edges_b = edges(&self.param_b, range_b, self.steps)?;

        let mut cells = Vec::with_capacity(self.steps * self.steps);
        for i in 0..self.steps {
            for j in 0..self.steps {
                cells.push(Cell {
                    i,
                    j,
                    a: (edges_a[i], edges_a[i + 1]),
                    b: (edges_b[j], edges_b[j + 1]),
                });
            }
        }
        Ok(cells)
    }
}

fn axis_range(model: &Model, path: &ParamPath) -> PfResult<(f64, f64)> {
    let prior = model
        .prior(path)
        .ok_or_else(|| config_error!("grid axis {path} is not a parameter of the model"))?;
    prior
        .uniform_bounds()
        .ok_or_else(|| config_error!("grid axis {path} must have a finite uniform prior, got {prior}"))
}

/// `steps + 1` strictly increasing bin edges; the last edge is exactly the
/// upper bound so the cells tile the range without gaps.
fn edges(path: &ParamPath, (lower, upper): (f64, f64), steps: usize) -> PfResult<Vec<f64>> {
    let width = upper - lower;
    let mut edges: Vec<f64> = (0..steps)
        .map(|k| lower + width * (k as f64) / (steps as f64))
        .collect();
    edges.push(upper);
    if let Some(k) = edges.windows(2).position(|pair| pair[0] >= pair[1]) {
        return Err(config_error!(
            "grid axis {path} range [{lower}, {upper}] is too narrow for {steps} steps: bin {k} is empty"
        ));
    }
    Ok(edges)
}

/// One grid cell; `a` and `b` are the `(lower, upper)` bounds of each axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub i: usize,
    pub j: usize,
    pub a: (f64, f64),
    pub b: (f64, f64),
}

impl Cell {
    /// Copy of `model` with both axes restricted to this cell.
    pub fn restrict(&self, model: &Model, spec: &GridSpec) -> PfResult<Model> {
        let mut cell_model = model.clone();
        for (path, (lower, upper)) in [(&spec.param_a, self.a), (&spec.param_b, self.b)] {
            let domain = model.require(path)?.domain;
            cell_model.set_prior(path, Prior::uniform(lower, upper).with_optional_domain(domain))?;
        }
        Ok(cell_model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResult {
    pub cell: Cell,
    pub result: FitResult,
}

/// Every cell's result plus the index of the best one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridResult {
    pub param_a: ParamPath,
    pub param_b: ParamPath,
    pub steps: usize,
    /// Row-major: cell `(i, j)` lives at `i * steps + j`.
    pub cells: Vec<CellResult>,
    pub best_index: usize,
}

impl GridResult {
    /// Assemble from row-major cell results. Ties keep the lowest index.
    pub fn from_cells(spec: &GridSpec, cells: Vec<CellResult>) -> PfResult<Self> {
        if cells.is_empty() {
            return Err(internal_error!("grid produced no cells"));
        }
        let mut best_index = 0;
        for (index, cell) in cells.iter().enumerate() {
            if cell.result.evidence > cells[best_index].result.evidence {
                best_index = index;
            }
        }
        Ok(Self {
            param_a: spec.param_a.clone(),
            param_b: spec.param_b.clone(),
            steps: spec.steps,
            cells,
            best_index,
        })
    }

    pub fn best(&self) -> &FitResult {
        &self.cells[self.best_index].result
    }

    pub fn best_cell(&self) -> Cell {
        self.cells[self.best_index].cell
    }

    pub fn evidence_map(&self) -> BTreeMap<(usize, usize), f64> {
        self.cells
            .iter()
            .map(|c| ((c.cell.i, c.cell.j), c.result.evidence))
            .collect()
    }
}

/// Outcome of a grid run together with the attempts made for every cell.
#[derive(Debug, Clone)]
pub struct GridOutcome {
    pub grid: GridResult,
    pub attempts: Vec<Attempt>,
}

/// Runs grid cells over a bounded worker pool.
pub struct GridSearch {
    ctx: CallContext,
    max_workers: usize,
}

impl GridSearch {
    pub fn new(ctx: CallContext, max_workers: usize) -> Self {
        Self {
            ctx,
            max_workers: max_workers.max(1),
        }
    }

    /// Fit every cell of `spec` cut from `model`. The first failing cell
    /// aborts the remaining ones.
    pub async fn run(
        &self,
        phase: &str,
        spec: &GridSpec,
        model: &Model,
        settings: &OptimizerSettings,
    ) -> PfResult<GridOutcome> {
        let cells = spec.cells(model)?;
        info!(
            phase = %phase,
            cells = cells.len(),
            workers = self.max_workers,
            "starting grid search"
        );

        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (index, cell) in cells.iter().enumerate() {
            let cell_model = cell.restrict(model, spec)?;
            let ctx = self.ctx.clone();
            let permits = permits.clone();
            let settings = settings.clone();
            let label = format!("{phase}[{},{}]", cell.i, cell.j);
            let cell = *cell;

            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| internal_error!("grid worker pool closed: {e}"))?;
                let outcome = ctx.fit(&label, &cell_model, &settings).await?;
                Ok::<_, pf_types::PfError>((index, cell, outcome))
            });
        }

        let mut slots: Vec<Option<CellResult>> = vec![None; cells.len()];
        let mut attempts = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| internal_error!("grid cell task failed: {e}"))
                .and_then(|r| r);
            let (index, cell, outcome) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    tasks.abort_all();
                    return Err(err);
                }
            };

            debug!(
                phase = %phase,
                i = cell.i,
                j = cell.j,
                evidence = outcome.result.evidence,
                "grid cell completed"
            );
            self.ctx.events.emit(PipelineEventKind::CellCompleted {
                phase: phase.to_string(),
                i: cell.i,
                j: cell.j,
                evidence: outcome.result.evidence,
            });

            attempts.extend(outcome.attempts);
            slots[index] = Some(CellResult {
                cell,
                result: outcome.result,
            });
        }

        let cells = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| internal_error!("grid finished with unfilled cells"))?;
        let grid = GridResult::from_cells(spec, cells)?;
        let best = grid.best_cell();
        info!(
            phase = %phase,
            i = best.i,
            j = best.j,
            evidence = grid.best().evidence,
            "grid search complete"
        );
        Ok(GridOutcome { grid, attempts })
    }
}
