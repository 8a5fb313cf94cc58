//! Simulation kernel for the petrigrid cell-colony world.
//!
//! The kernel owns a rectangular grid of sites. Each site carries a nutrient
//! state (oxygen and glucose) and at most one living cell. One call to
//! [`PetriWorld::step`] advances every cell through its lifecycle, runs a
//! diffusion pass over both nutrient fields, and either reports step metrics
//! or — when the population density crosses the configured threshold —
//! doubles the grid and re-centers its contents.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Age below which age-driven death never triggers.
pub const AGE_DEATH_ONSET: u32 = 50;
/// Width of the linear death ramp; death is certain at `AGE_DEATH_ONSET + AGE_DEATH_RAMP`.
pub const AGE_DEATH_RAMP: f64 = 100.0;

/// Growth-rate multiplier applied when a cell mutates.
pub const MUTATION_GROWTH_SCALE: f64 = 1.2;
/// Consumption-rate multiplier applied to both resources when a cell mutates.
pub const MUTATION_CONSUMPTION_SCALE: f64 = 1.5;
/// Survival-threshold multiplier applied to both resources when a cell mutates.
pub const MUTATION_THRESHOLD_SCALE: f64 = 2.0;

/// Linear scale applied to both grid dimensions on expansion.
pub const EXPANSION_FACTOR: u32 = 2;

/// Rejection-sampling attempts allowed per founder before seeding gives up.
const SEED_ATTEMPT_BUDGET: u32 = 1_000;

/// Display colors cycled across colonies in creation order.
const COLONY_PALETTE: [&str; 6] = [
    "#22c55e", "#ef4444", "#3b82f6", "#f59e0b", "#8b5cf6", "#ec4899",
];

/// Bernoulli trial: returns `true` with the given probability.
///
/// Probabilities at or below 0 never succeed; probabilities at or above 1
/// always succeed. All simulation randomness flows through the world's
/// seeded [`SmallRng`], so runs with a fixed seed are reproducible.
pub fn chance(rng: &mut SmallRng, probability: f64) -> bool {
    rng.random::<f64>() < probability
}

/// Probability that a cell of the given age dies of old age this step.
///
/// Zero below [`AGE_DEATH_ONSET`], then a linear ramp reaching certainty
/// once the ramp width has elapsed.
#[must_use]
pub fn age_death_probability(age: u32) -> f64 {
    if age < AGE_DEATH_ONSET {
        return 0.0;
    }
    (f64::from(age - AGE_DEATH_ONSET) / AGE_DEATH_RAMP).min(1.0)
}

/// Grid-edge-clipped Moore neighborhood (no wraparound).
fn neighbor_coords(x: u32, y: u32, width: u32, height: u32) -> SmallVec<[(u32, u32); 8]> {
    let mut neighbors = SmallVec::new();
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = i64::from(x) + dx;
            let ny = i64::from(y) + dy;
            if nx >= 0 && ny >= 0 && (nx as u32) < width && (ny as u32) < height {
                neighbors.push((nx as u32, ny as u32));
            }
        }
    }
    neighbors
}

/// Errors raised by world construction and edit operations.
///
/// All kernel errors are local and synchronous: a failed call leaves the
/// world exactly as it was before the call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PetriError {
    /// Out-of-range configuration or edit value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// Coordinates outside the grid bounds.
    #[error("coordinate ({x}, {y}) is outside the {width}x{height} grid")]
    InvalidLocation {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// Attempt to place a cell on an occupied site.
    #[error("site ({x}, {y}) is already occupied")]
    OccupiedSite { x: u32, y: u32 },
}

/// Lifecycle state of a living cell.
///
/// Death is not a state: a dead cell's site slot is cleared instead, so
/// "no cell" and "dead cell" cannot diverge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CellState {
    Healthy,
    Mutated,
}

/// One diffusing resource at one site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceField {
    /// Current level, clamped to be non-negative after every update.
    pub level: f64,
    /// Blend factor toward the neighborhood mean per diffusion pass, in [0, 1].
    pub diffusion_rate: f64,
}

/// Both nutrient fields carried by a site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NutrientState {
    pub oxygen: ResourceField,
    pub glucose: ResourceField,
}

/// How a cell draws on one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceUseParams {
    /// Scaled by the cell's growth rate to give the per-step debit.
    pub consumption_rate: f64,
    /// Minimum pre-consumption level required to survive the step.
    pub survival_threshold: f64,
}

/// A living cell occupying one grid site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellRecord {
    pub x: u32,
    pub y: u32,
    /// Root colony this cell descends from.
    pub colony: Uuid,
    /// Display color shared by the whole colony.
    pub color: String,
    pub state: CellState,
    pub age: u32,
    /// Probability of a division attempt per step; also scales consumption.
    pub growth_rate: f64,
    /// Probability of the one-shot Healthy -> Mutated flip per step.
    pub mutation_probability: f64,
    pub oxygen: ResourceUseParams,
    pub glucose: ResourceUseParams,
}

impl CellRecord {
    /// A founder or host-placed cell with configured default parameters.
    fn fresh(x: u32, y: u32, colony: &RootColony, config: &PetriConfig) -> Self {
        let use_params = ResourceUseParams {
            consumption_rate: config.initial_consumption_rate,
            survival_threshold: config.initial_survival_threshold,
        };
        Self {
            x,
            y,
            colony: colony.id,
            color: colony.color.clone(),
            state: CellState::Healthy,
            age: 0,
            growth_rate: config.initial_growth_rate,
            mutation_probability: config.initial_mutation_probability,
            oxygen: use_params,
            glucose: use_params,
        }
    }

    /// A child cell: inherits the parent's colony, state, and current
    /// parameter magnitudes. Division applies no scaling of its own.
    fn offspring(&self, x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            colony: self.colony,
            color: self.color.clone(),
            state: self.state,
            age: 0,
            growth_rate: self.growth_rate,
            mutation_probability: self.mutation_probability,
            oxygen: self.oxygen,
            glucose: self.glucose,
        }
    }
}

/// One grid site: position, nutrient state, and at most one living cell.
///
/// Invariant: `x` and `y` always match the site's position in the grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridCell {
    pub x: u32,
    pub y: u32,
    pub cell: Option<CellRecord>,
    pub nutrient: NutrientState,
}

/// Identity and display color shared by all descendants of one founder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootColony {
    pub id: Uuid,
    pub color: String,
}

/// Resource selector for nutrient edits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Resource {
    Oxygen,
    Glucose,
}

/// Simulation step counter (steps processed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Step(pub u64);

impl Step {
    /// Returns the next sequential step.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Connected-component statistics over the living population.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterReport {
    pub total_clusters: usize,
    pub healthy_clusters: usize,
    pub mutated_clusters: usize,
}

/// Per-step population metrics emitted by a normal (non-expanding) step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepMetrics {
    pub step: Step,
    pub healthy: usize,
    pub mutated: usize,
    pub total: usize,
    pub clusters: ClusterReport,
}

/// Result of one kernel step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepOutcome {
    /// Normal step: the grid advanced and metrics were recorded.
    Stepped(StepMetrics),
    /// Density crossed the threshold: the grid was replaced by a larger one
    /// and this step emitted no metrics.
    Expanded { width: u32, height: u32 },
}

/// Initial level and diffusion rate for one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceSettings {
    pub initial_level: f64,
    pub diffusion_rate: f64,
}

/// Static configuration for a petrigrid world.
///
/// Structural parameters (dimensions, founder count, nutrient settings)
/// cannot change on a live world; build a new one instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PetriConfig {
    /// Grid width in sites.
    pub grid_width: u32,
    /// Grid height in sites.
    pub grid_height: u32,
    /// Pacing interval for hosts that drive steps on a timer.
    pub step_interval_ms: u32,
    /// Population density (living cells / sites) above which the grid doubles.
    pub max_density_threshold: f64,
    /// Number of founder cells seeded at construction.
    pub initial_cell_count: u32,
    /// Default division probability for founders and host-placed cells.
    pub initial_growth_rate: f64,
    /// Default mutation probability for founders and host-placed cells.
    pub initial_mutation_probability: f64,
    /// Default per-resource consumption rate.
    pub initial_consumption_rate: f64,
    /// Default per-resource survival threshold.
    pub initial_survival_threshold: f64,
    pub oxygen: ResourceSettings,
    pub glucose: ResourceSettings,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Maximum number of recent step metrics retained in memory.
    pub history_capacity: usize,
}

impl Default for PetriConfig {
    fn default() -> Self {
        Self {
            grid_width: 30,
            grid_height: 30,
            step_interval_ms: 200,
            max_density_threshold: 0.75,
            initial_cell_count: 5,
            initial_growth_rate: 0.05,
            initial_mutation_probability: 0.000_5,
            initial_consumption_rate: 0.5,
            initial_survival_threshold: 5.0,
            oxygen: ResourceSettings {
                initial_level: 100.0,
                diffusion_rate: 0.15,
            },
            glucose: ResourceSettings {
                initial_level: 100.0,
                diffusion_rate: 0.15,
            },
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl PetriConfig {
    /// Total number of sites the configured grid holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.grid_width as usize * self.grid_height as usize
    }

    /// Validates every field, returning the first violated rule.
    pub fn validate(&self) -> Result<(), PetriError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(PetriError::InvalidParameter(
                "grid dimensions must be non-zero",
            ));
        }
        if self.step_interval_ms == 0 {
            return Err(PetriError::InvalidParameter(
                "step_interval_ms must be non-zero",
            ));
        }
        if !(self.max_density_threshold > 0.0 && self.max_density_threshold <= 1.0) {
            return Err(PetriError::InvalidParameter(
                "max_density_threshold must be in (0, 1]",
            ));
        }
        if self.initial_cell_count as usize > self.capacity() {
            return Err(PetriError::InvalidParameter(
                "initial_cell_count cannot exceed grid capacity",
            ));
        }
        if !(self.initial_growth_rate > 0.0 && self.initial_growth_rate <= 1.0) {
            return Err(PetriError::InvalidParameter(
                "initial_growth_rate must be in (0, 1]",
            ));
        }
        if !(self.initial_mutation_probability >= 0.0 && self.initial_mutation_probability <= 1.0)
        {
            return Err(PetriError::InvalidParameter(
                "initial_mutation_probability must be in [0, 1]",
            ));
        }
        if !(self.initial_consumption_rate.is_finite() && self.initial_consumption_rate >= 0.0) {
            return Err(PetriError::InvalidParameter(
                "initial_consumption_rate must be non-negative",
            ));
        }
        if !(self.initial_survival_threshold.is_finite()
            && self.initial_survival_threshold >= 0.0)
        {
            return Err(PetriError::InvalidParameter(
                "initial_survival_threshold must be non-negative",
            ));
        }
        Self::validate_resource(
            &self.oxygen,
            "oxygen initial_level must be non-negative",
            "oxygen diffusion_rate must be in [0, 1]",
        )?;
        Self::validate_resource(
            &self.glucose,
            "glucose initial_level must be non-negative",
            "glucose diffusion_rate must be in [0, 1]",
        )?;
        if self.history_capacity == 0 {
            return Err(PetriError::InvalidParameter(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    fn validate_resource(
        settings: &ResourceSettings,
        level_rule: &'static str,
        rate_rule: &'static str,
    ) -> Result<(), PetriError> {
        if !(settings.initial_level.is_finite() && settings.initial_level >= 0.0) {
            return Err(PetriError::InvalidParameter(level_rule));
        }
        if !(settings.diffusion_rate >= 0.0 && settings.diffusion_rate <= 1.0) {
            return Err(PetriError::InvalidParameter(rate_rule));
        }
        Ok(())
    }

    /// Nutrient state every freshly allocated site starts with.
    #[must_use]
    pub fn initial_nutrient(&self) -> NutrientState {
        NutrientState {
            oxygen: ResourceField {
                level: self.oxygen.initial_level,
                diffusion_rate: self.oxygen.diffusion_rate,
            },
            glucose: ResourceField {
                level: self.glucose.initial_level,
                diffusion_rate: self.glucose.diffusion_rate,
            },
        }
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Row-major grid of sites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grid {
    width: u32,
    height: u32,
    sites: Vec<GridCell>,
}

impl Grid {
    /// Construct a grid with every site empty and carrying `nutrient`.
    pub fn new(width: u32, height: u32, nutrient: NutrientState) -> Result<Self, PetriError> {
        if width == 0 || height == 0 {
            return Err(PetriError::InvalidParameter(
                "grid dimensions must be non-zero",
            ));
        }
        Ok(Self::filled(width, height, nutrient))
    }

    fn filled(width: u32, height: u32, nutrient: NutrientState) -> Self {
        let mut sites = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                sites.push(GridCell {
                    x,
                    y,
                    cell: None,
                    nutrient,
                });
            }
        }
        Self {
            width,
            height,
            sites,
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Total number of sites.
    #[must_use]
    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Returns true if `(x, y)` lies inside the grid.
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Immutable access to a specific site.
    #[must_use]
    pub fn site(&self, x: u32, y: u32) -> Option<&GridCell> {
        if self.contains(x, y) {
            Some(&self.sites[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Mutable access to a specific site.
    pub fn site_mut(&mut self, x: u32, y: u32) -> Option<&mut GridCell> {
        if self.contains(x, y) {
            let idx = self.offset(x, y);
            Some(&mut self.sites[idx])
        } else {
            None
        }
    }

    /// All sites in row-major order.
    #[must_use]
    pub fn sites(&self) -> &[GridCell] {
        &self.sites
    }

    /// Iterate over the living cells in row-major order.
    pub fn living_cells(&self) -> impl Iterator<Item = &CellRecord> {
        self.sites.iter().filter_map(|site| site.cell.as_ref())
    }

    /// Number of living cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.living_cells().count()
    }

    /// Partition the living population into maximal 8-connected clusters and
    /// classify each as healthy or mutated.
    ///
    /// A cluster counts as mutated if any member is mutated; connectivity is
    /// purely spatial adjacency of life, independent of colony or state. The
    /// scan is row-major, so the result is deterministic for fixed contents.
    #[must_use]
    pub fn analyze_clusters(&self) -> ClusterReport {
        let mut report = ClusterReport::default();
        let mut visited = vec![false; self.sites.len()];
        let mut queue = VecDeque::new();

        for start in 0..self.sites.len() {
            if visited[start] {
                continue;
            }
            let Some(cell) = self.sites[start].cell.as_ref() else {
                continue;
            };
            visited[start] = true;
            let mut mutated = cell.state == CellState::Mutated;
            queue.push_back(start);

            while let Some(index) = queue.pop_front() {
                let site = &self.sites[index];
                for (nx, ny) in neighbor_coords(site.x, site.y, self.width, self.height) {
                    let neighbor_index = self.offset(nx, ny);
                    if visited[neighbor_index] {
                        continue;
                    }
                    let Some(neighbor) = self.sites[neighbor_index].cell.as_ref() else {
                        continue;
                    };
                    visited[neighbor_index] = true;
                    queue.push_back(neighbor_index);
                    if neighbor.state == CellState::Mutated {
                        mutated = true;
                    }
                }
            }

            report.total_clusters += 1;
            if mutated {
                report.mutated_clusters += 1;
            } else {
                report.healthy_clusters += 1;
            }
        }
        report
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LifeTally {
    healthy: usize,
    mutated: usize,
}

impl LifeTally {
    const fn total(self) -> usize {
        self.healthy + self.mutated
    }
}

/// The simulation world: grid, colonies, RNG, and step bookkeeping.
///
/// Every mutating operation takes `&mut self`, so steps and host edits are
/// serialized by ownership; nothing can observe a half-finished step.
pub struct PetriWorld {
    config: PetriConfig,
    step: Step,
    rng: SmallRng,
    grid: Grid,
    colonies: Vec<RootColony>,
    diffusion_scratch: Vec<(f64, f64)>,
    history: VecDeque<StepMetrics>,
}

impl fmt::Debug for PetriWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PetriWorld")
            .field("step", &self.step)
            .field("width", &self.grid.width())
            .field("height", &self.grid.height())
            .field("cell_count", &self.grid.cell_count())
            .field("colony_count", &self.colonies.len())
            .finish()
    }
}

impl PetriWorld {
    /// Build a world from `config`: validate, allocate the grid, and seed
    /// founder colonies.
    ///
    /// Seeding is a soft operation — if the attempt budget runs out the
    /// colony list comes back shorter than requested and a warning is
    /// logged; construction still succeeds.
    pub fn new(config: PetriConfig) -> Result<Self, PetriError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let grid = Grid::new(config.grid_width, config.grid_height, config.initial_nutrient())?;
        let history_capacity = config.history_capacity;
        let mut world = Self {
            step: Step::zero(),
            rng,
            grid,
            colonies: Vec::new(),
            diffusion_scratch: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            config,
        };
        world.seed_founders();
        Ok(world)
    }

    /// Execute one simulation step.
    ///
    /// Pipeline: lifecycle scan → diffusion pass → density check. Above the
    /// density threshold the grid expands and the step yields
    /// [`StepOutcome::Expanded`] with no metrics; otherwise the cluster
    /// analyzer runs and the step yields [`StepOutcome::Stepped`].
    pub fn step(&mut self) -> StepOutcome {
        self.step = self.step.next();

        let tally = self.stage_lifecycle();
        self.stage_diffusion();

        let density = tally.total() as f64 / self.grid.site_count() as f64;
        if density > self.config.max_density_threshold {
            let (width, height) = self.expand_grid();
            return StepOutcome::Expanded { width, height };
        }

        let clusters = self.grid.analyze_clusters();
        let metrics = StepMetrics {
            step: self.step,
            healthy: tally.healthy,
            mutated: tally.mutated,
            total: tally.total(),
            clusters,
        };
        self.push_history(metrics);
        StepOutcome::Stepped(metrics)
    }

    /// Advance every cell that was alive at scan start.
    ///
    /// Offspring placed during the scan occupy their sites immediately (and
    /// so block later division attempts from targeting them) but are not
    /// themselves advanced until the next step.
    fn stage_lifecycle(&mut self) -> LifeTally {
        let mut tally = LifeTally::default();
        let occupied: Vec<(u32, u32)> = self
            .grid
            .sites()
            .iter()
            .filter(|site| site.cell.is_some())
            .map(|site| (site.x, site.y))
            .collect();

        for (x, y) in occupied {
            // Taking the record vacates the slot; it is only restored if the
            // cell survives the step.
            let Some(mut cell) = self.grid.site_mut(x, y).and_then(|site| site.cell.take())
            else {
                continue;
            };

            self.attempt_mutation(&mut cell);

            if chance(&mut self.rng, age_death_probability(cell.age)) {
                continue;
            }

            if !self.apply_consumption(&cell) {
                continue;
            }

            if chance(&mut self.rng, cell.growth_rate) {
                self.attempt_division(&cell);
            }

            cell.age += 1;
            match cell.state {
                CellState::Healthy => tally.healthy += 1,
                CellState::Mutated => tally.mutated += 1,
            }
            if let Some(site) = self.grid.site_mut(x, y) {
                site.cell = Some(cell);
            }
        }
        tally
    }

    /// One-shot Healthy -> Mutated flip with parameter scaling.
    fn attempt_mutation(&mut self, cell: &mut CellRecord) {
        if cell.state == CellState::Healthy && chance(&mut self.rng, cell.mutation_probability) {
            cell.state = CellState::Mutated;
            cell.growth_rate *= MUTATION_GROWTH_SCALE;
            cell.oxygen.consumption_rate *= MUTATION_CONSUMPTION_SCALE;
            cell.glucose.consumption_rate *= MUTATION_CONSUMPTION_SCALE;
            cell.oxygen.survival_threshold *= MUTATION_THRESHOLD_SCALE;
            cell.glucose.survival_threshold *= MUTATION_THRESHOLD_SCALE;
        }
    }

    /// Debit both resources at the cell's site and report viability.
    ///
    /// Viability is judged against the pre-consumption levels; the debit is
    /// applied to the grid even when the cell dies of starvation.
    fn apply_consumption(&mut self, cell: &CellRecord) -> bool {
        let oxygen_needed = cell.growth_rate * cell.oxygen.consumption_rate;
        let glucose_needed = cell.growth_rate * cell.glucose.consumption_rate;
        let Some(site) = self.grid.site_mut(cell.x, cell.y) else {
            return false;
        };
        let oxygen_ok = site.nutrient.oxygen.level >= cell.oxygen.survival_threshold;
        let glucose_ok = site.nutrient.glucose.level >= cell.glucose.survival_threshold;
        site.nutrient.oxygen.level = (site.nutrient.oxygen.level - oxygen_needed).max(0.0);
        site.nutrient.glucose.level = (site.nutrient.glucose.level - glucose_needed).max(0.0);
        oxygen_ok && glucose_ok
    }

    /// Place an offspring on a uniformly chosen empty Moore neighbor, if any.
    fn attempt_division(&mut self, parent: &CellRecord) {
        let mut empty: SmallVec<[(u32, u32); 8]> = SmallVec::new();
        for (nx, ny) in neighbor_coords(parent.x, parent.y, self.grid.width(), self.grid.height())
        {
            if self
                .grid
                .site(nx, ny)
                .is_some_and(|site| site.cell.is_none())
            {
                empty.push((nx, ny));
            }
        }
        if empty.is_empty() {
            return;
        }
        let (x, y) = empty[self.rng.random_range(0..empty.len())];
        if let Some(site) = self.grid.site_mut(x, y) {
            site.cell = Some(parent.offspring(x, y));
        }
    }

    /// One stencil pass over both nutrient fields.
    ///
    /// Levels are snapshotted into a reusable scratch buffer first; every
    /// site's new level depends only on the snapshot, so the per-site writes
    /// are independent and run in parallel with sequentially identical
    /// results.
    fn stage_diffusion(&mut self) {
        let width = self.grid.width();
        let height = self.grid.height();
        let len = self.grid.site_count();
        self.diffusion_scratch.resize(len, (0.0, 0.0));
        for (snapshot, site) in self.diffusion_scratch.iter_mut().zip(self.grid.sites()) {
            *snapshot = (site.nutrient.oxygen.level, site.nutrient.glucose.level);
        }

        let previous = &self.diffusion_scratch;
        self.grid
            .sites
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, site)| {
                let (oxygen_before, glucose_before) = previous[idx];
                let mut oxygen_sum = oxygen_before;
                let mut glucose_sum = glucose_before;
                let mut count = 1.0;
                for (nx, ny) in neighbor_coords(site.x, site.y, width, height) {
                    let (oxygen, glucose) = previous[ny as usize * width as usize + nx as usize];
                    oxygen_sum += oxygen;
                    glucose_sum += glucose;
                    count += 1.0;
                }

                let oxygen = &mut site.nutrient.oxygen;
                oxygen.level = (oxygen_before
                    + oxygen.diffusion_rate * (oxygen_sum / count - oxygen_before))
                    .max(0.0);
                let glucose = &mut site.nutrient.glucose;
                glucose.level = (glucose_before
                    + glucose.diffusion_rate * (glucose_sum / count - glucose_before))
                    .max(0.0);
            });
    }

    /// Replace the grid with one scaled by [`EXPANSION_FACTOR`], copying
    /// every old site's cell and nutrient state to a centered offset.
    fn expand_grid(&mut self) -> (u32, u32) {
        let old_width = self.grid.width();
        let old_height = self.grid.height();
        let new_width = old_width * EXPANSION_FACTOR;
        let new_height = old_height * EXPANSION_FACTOR;
        let offset_x = (new_width - old_width) / 2;
        let offset_y = (new_height - old_height) / 2;

        let old = std::mem::replace(
            &mut self.grid,
            Grid::filled(new_width, new_height, self.config.initial_nutrient()),
        );
        for old_site in old.sites {
            let x = old_site.x + offset_x;
            let y = old_site.y + offset_y;
            if let Some(target) = self.grid.site_mut(x, y) {
                target.nutrient = old_site.nutrient;
                target.cell = old_site.cell.map(|mut cell| {
                    cell.x = x;
                    cell.y = y;
                    cell
                });
            }
        }

        info!(
            old_width,
            old_height, new_width, new_height, "grid expanded under density pressure"
        );
        (new_width, new_height)
    }

    /// Seed the configured number of founder colonies at distinct random
    /// empty coordinates.
    fn seed_founders(&mut self) {
        let requested = self.config.initial_cell_count;
        for _ in 0..requested {
            let Some((x, y)) = self.find_empty_site() else {
                warn!(
                    placed = self.colonies.len(),
                    requested, "seeding stopped early: attempt budget exhausted"
                );
                return;
            };
            let colony = self.register_colony();
            let founder = CellRecord::fresh(x, y, &colony, &self.config);
            if let Some(site) = self.grid.site_mut(x, y) {
                site.cell = Some(founder);
            }
        }
    }

    /// Rejection-sample an empty coordinate within the attempt budget.
    fn find_empty_site(&mut self) -> Option<(u32, u32)> {
        for _ in 0..SEED_ATTEMPT_BUDGET {
            let x = self.rng.random_range(0..self.grid.width());
            let y = self.rng.random_range(0..self.grid.height());
            if self
                .grid
                .site(x, y)
                .is_some_and(|site| site.cell.is_none())
            {
                return Some((x, y));
            }
        }
        None
    }

    /// Mint a colony with a fresh id and the next palette color.
    ///
    /// Ids are drawn from the world RNG so seeded runs reproduce exactly.
    fn register_colony(&mut self) -> RootColony {
        let colony = RootColony {
            id: Uuid::from_u128(self.rng.random()),
            color: COLONY_PALETTE[self.colonies.len() % COLONY_PALETTE.len()].to_string(),
        };
        self.colonies.push(colony.clone());
        colony
    }

    fn push_history(&mut self, metrics: StepMetrics) {
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    /// Place a fresh cell at `(x, y)` under a newly minted colony.
    pub fn place_cell(&mut self, x: u32, y: u32) -> Result<(), PetriError> {
        let Some(site) = self.grid.site(x, y) else {
            return Err(self.out_of_bounds(x, y));
        };
        if site.cell.is_some() {
            return Err(PetriError::OccupiedSite { x, y });
        }
        let colony = self.register_colony();
        let record = CellRecord::fresh(x, y, &colony, &self.config);
        if let Some(site) = self.grid.site_mut(x, y) {
            site.cell = Some(record);
        }
        Ok(())
    }

    /// Clear the cell slot at `(x, y)`; a no-op when already empty.
    pub fn remove_cell(&mut self, x: u32, y: u32) -> Result<(), PetriError> {
        if !self.grid.contains(x, y) {
            return Err(self.out_of_bounds(x, y));
        }
        if let Some(site) = self.grid.site_mut(x, y) {
            site.cell = None;
        }
        Ok(())
    }

    /// Overwrite one resource level at `(x, y)`.
    pub fn set_nutrient_level(
        &mut self,
        x: u32,
        y: u32,
        resource: Resource,
        value: f64,
    ) -> Result<(), PetriError> {
        if !(value.is_finite() && value >= 0.0) {
            return Err(PetriError::InvalidParameter(
                "nutrient level must be non-negative and finite",
            ));
        }
        if !self.grid.contains(x, y) {
            return Err(self.out_of_bounds(x, y));
        }
        if let Some(site) = self.grid.site_mut(x, y) {
            match resource {
                Resource::Oxygen => site.nutrient.oxygen.level = value,
                Resource::Glucose => site.nutrient.glucose.level = value,
            }
        }
        Ok(())
    }

    fn out_of_bounds(&self, x: u32, y: u32) -> PetriError {
        PetriError::InvalidLocation {
            x,
            y,
            width: self.grid.width(),
            height: self.grid.height(),
        }
    }

    /// Returns an immutable reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &PetriConfig {
        &self.config
    }

    /// Immutable access to the grid.
    #[must_use]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Mutable access to the grid (for host edit tooling and tests).
    #[must_use]
    pub fn grid_mut(&mut self) -> &mut Grid {
        &mut self.grid
    }

    /// Root colonies in creation order.
    #[must_use]
    pub fn colonies(&self) -> &[RootColony] {
        &self.colonies
    }

    /// Steps processed since construction.
    #[must_use]
    pub const fn current_step(&self) -> Step {
        self.step
    }

    /// Iterate over retained step metrics, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepMetrics> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PetriConfig {
        PetriConfig {
            grid_width: 10,
            grid_height: 10,
            initial_cell_count: 0,
            rng_seed: Some(42),
            ..PetriConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(PetriConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_each_out_of_range_field() {
        let cases: Vec<(&str, Box<dyn Fn(&mut PetriConfig)>)> = vec![
            ("zero width", Box::new(|c| c.grid_width = 0)),
            ("zero height", Box::new(|c| c.grid_height = 0)),
            ("zero interval", Box::new(|c| c.step_interval_ms = 0)),
            ("zero threshold", Box::new(|c| c.max_density_threshold = 0.0)),
            (
                "threshold above one",
                Box::new(|c| c.max_density_threshold = 1.5),
            ),
            ("zero growth", Box::new(|c| c.initial_growth_rate = 0.0)),
            (
                "growth above one",
                Box::new(|c| c.initial_growth_rate = 1.01),
            ),
            (
                "negative mutation",
                Box::new(|c| c.initial_mutation_probability = -0.1),
            ),
            (
                "mutation above one",
                Box::new(|c| c.initial_mutation_probability = 1.1),
            ),
            (
                "negative consumption",
                Box::new(|c| c.initial_consumption_rate = -1.0),
            ),
            (
                "negative threshold",
                Box::new(|c| c.initial_survival_threshold = -1.0),
            ),
            (
                "negative oxygen level",
                Box::new(|c| c.oxygen.initial_level = -1.0),
            ),
            (
                "oxygen diffusion above one",
                Box::new(|c| c.oxygen.diffusion_rate = 1.5),
            ),
            (
                "negative glucose diffusion",
                Box::new(|c| c.glucose.diffusion_rate = -0.1),
            ),
            ("zero history", Box::new(|c| c.history_capacity = 0)),
            (
                "too many founders",
                Box::new(|c| {
                    c.grid_width = 3;
                    c.grid_height = 3;
                    c.initial_cell_count = 10;
                }),
            ),
        ];
        for (label, mutate) in cases {
            let mut config = PetriConfig::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(PetriError::InvalidParameter(_))),
                "expected rejection for case: {label}"
            );
        }
    }

    #[test]
    fn grid_sites_carry_their_own_coordinates() {
        let config = test_config();
        let grid = Grid::new(4, 3, config.initial_nutrient()).expect("grid");
        assert_eq!(grid.site_count(), 12);
        for site in grid.sites() {
            assert_eq!(grid.site(site.x, site.y), Some(site));
            assert!(site.cell.is_none());
            assert!((site.nutrient.oxygen.level - 100.0).abs() < f64::EPSILON);
        }
        assert!(grid.site(4, 0).is_none());
        assert!(grid.site(0, 3).is_none());
    }

    #[test]
    fn neighbor_coords_clip_at_edges() {
        assert_eq!(neighbor_coords(0, 0, 5, 5).len(), 3);
        assert_eq!(neighbor_coords(2, 0, 5, 5).len(), 5);
        assert_eq!(neighbor_coords(2, 2, 5, 5).len(), 8);
        assert_eq!(neighbor_coords(4, 4, 5, 5).len(), 3);
        assert_eq!(neighbor_coords(0, 0, 1, 1).len(), 0);
        assert!(
            neighbor_coords(1, 1, 3, 3)
                .iter()
                .all(|&(x, y)| x < 3 && y < 3 && (x, y) != (1, 1))
        );
    }

    #[test]
    fn age_death_probability_follows_the_ramp() {
        assert_eq!(age_death_probability(0), 0.0);
        assert_eq!(age_death_probability(49), 0.0);
        assert_eq!(age_death_probability(50), 0.0);
        assert!((age_death_probability(100) - 0.5).abs() < 1e-12);
        assert_eq!(age_death_probability(150), 1.0);
        assert_eq!(age_death_probability(400), 1.0);
    }

    #[test]
    fn chance_is_exact_at_the_extremes() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..1_000 {
            assert!(!chance(&mut rng, 0.0));
            assert!(!chance(&mut rng, -1.0));
            assert!(chance(&mut rng, 1.0));
        }
    }

    #[test]
    fn analyze_clusters_on_empty_grid_is_all_zero() {
        let grid = Grid::new(6, 6, test_config().initial_nutrient()).expect("grid");
        assert_eq!(grid.analyze_clusters(), ClusterReport::default());
    }

    #[test]
    fn analyze_clusters_counts_an_isolated_healthy_cell() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        world.place_cell(4, 4).expect("place");
        let report = world.grid().analyze_clusters();
        assert_eq!(report.total_clusters, 1);
        assert_eq!(report.healthy_clusters, 1);
        assert_eq!(report.mutated_clusters, 0);
    }

    #[test]
    fn one_mutated_member_taints_the_whole_cluster() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        // An 8-connected chain: orthogonal, then diagonal.
        world.place_cell(2, 2).expect("place");
        world.place_cell(3, 2).expect("place");
        world.place_cell(4, 3).expect("place");
        if let Some(site) = world.grid_mut().site_mut(4, 3) {
            site.cell.as_mut().expect("cell").state = CellState::Mutated;
        }
        // A separate healthy singleton, far away.
        world.place_cell(8, 8).expect("place");

        let report = world.grid().analyze_clusters();
        assert_eq!(report.total_clusters, 2);
        assert_eq!(report.healthy_clusters, 1);
        assert_eq!(report.mutated_clusters, 1);
    }

    #[test]
    fn seeding_places_the_requested_founders() {
        let config = PetriConfig {
            grid_width: 20,
            grid_height: 20,
            initial_cell_count: 8,
            rng_seed: Some(11),
            ..PetriConfig::default()
        };
        let world = PetriWorld::new(config).expect("world");
        assert_eq!(world.grid().cell_count(), 8);
        assert_eq!(world.colonies().len(), 8);

        // Distinct ids, palette cycling in creation order.
        let mut ids: Vec<Uuid> = world.colonies().iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(world.colonies()[0].color, COLONY_PALETTE[0]);
        assert_eq!(world.colonies()[6].color, COLONY_PALETTE[0]);

        // Every founder is healthy, age zero, and sits where its site says.
        for cell in world.grid().living_cells() {
            assert_eq!(cell.state, CellState::Healthy);
            assert_eq!(cell.age, 0);
            assert_eq!(
                world.grid().site(cell.x, cell.y).and_then(|s| s.cell.as_ref()),
                Some(cell)
            );
        }
    }

    #[test]
    fn seeding_can_fill_a_tiny_grid_completely() {
        let config = PetriConfig {
            grid_width: 2,
            grid_height: 2,
            initial_cell_count: 4,
            rng_seed: Some(3),
            ..PetriConfig::default()
        };
        // The last founder has a single empty site left; rejection sampling
        // must still land on it within the attempt budget.
        let world = PetriWorld::new(config).expect("world");
        assert_eq!(world.grid().cell_count(), 4);
    }

    #[test]
    fn place_cell_rejects_occupied_and_out_of_bounds() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        world.place_cell(1, 1).expect("place");
        assert_eq!(
            world.place_cell(1, 1),
            Err(PetriError::OccupiedSite { x: 1, y: 1 })
        );
        assert_eq!(
            world.place_cell(10, 0),
            Err(PetriError::InvalidLocation {
                x: 10,
                y: 0,
                width: 10,
                height: 10
            })
        );
        // Failed placements mint no colony.
        assert_eq!(world.colonies().len(), 1);
    }

    #[test]
    fn remove_cell_is_a_no_op_on_empty_sites() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        world.place_cell(2, 3).expect("place");
        world.remove_cell(2, 3).expect("remove");
        assert_eq!(world.grid().cell_count(), 0);
        world.remove_cell(2, 3).expect("second remove is a no-op");
        assert!(matches!(
            world.remove_cell(99, 99),
            Err(PetriError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn set_nutrient_level_validates_value_and_location() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        world
            .set_nutrient_level(0, 0, Resource::Oxygen, 12.5)
            .expect("set");
        assert!(
            (world.grid().site(0, 0).expect("site").nutrient.oxygen.level - 12.5).abs()
                < f64::EPSILON
        );
        assert!(matches!(
            world.set_nutrient_level(0, 0, Resource::Glucose, -1.0),
            Err(PetriError::InvalidParameter(_))
        ));
        assert!(matches!(
            world.set_nutrient_level(0, 0, Resource::Glucose, f64::NAN),
            Err(PetriError::InvalidParameter(_))
        ));
        assert!(matches!(
            world.set_nutrient_level(0, 10, Resource::Oxygen, 1.0),
            Err(PetriError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn mutation_scales_parameters_exactly_once() {
        let mut config = test_config();
        config.initial_mutation_probability = 1.0;
        config.initial_survival_threshold = 0.0;
        config.initial_growth_rate = 0.05;
        let mut world = PetriWorld::new(config).expect("world");
        world.place_cell(5, 5).expect("place");

        world.step();
        let cell = world
            .grid()
            .site(5, 5)
            .and_then(|s| s.cell.as_ref())
            .expect("cell survives")
            .clone();
        assert_eq!(cell.state, CellState::Mutated);
        assert!((cell.growth_rate - 0.05 * MUTATION_GROWTH_SCALE).abs() < 1e-12);
        assert!((cell.oxygen.consumption_rate - 0.5 * MUTATION_CONSUMPTION_SCALE).abs() < 1e-12);
        assert!((cell.glucose.survival_threshold - 0.0).abs() < f64::EPSILON);

        // Mutated is terminal: a second step must not scale again.
        world.step();
        let cell_after = world
            .grid()
            .site(5, 5)
            .and_then(|s| s.cell.as_ref())
            .expect("cell survives");
        assert!((cell_after.growth_rate - cell.growth_rate).abs() < 1e-12);
        assert!(
            (cell_after.oxygen.consumption_rate - cell.oxygen.consumption_rate).abs() < 1e-12
        );
    }

    #[test]
    fn starvation_kills_but_still_debits_the_site() {
        let mut config = test_config();
        config.initial_survival_threshold = 5.0;
        config.initial_consumption_rate = 2.0;
        config.initial_growth_rate = 1.0;
        let mut world = PetriWorld::new(config).expect("world");
        world.place_cell(4, 4).expect("place");
        world
            .set_nutrient_level(4, 4, Resource::Oxygen, 4.0)
            .expect("set oxygen below threshold");

        world.step();
        assert!(
            world
                .grid()
                .site(4, 4)
                .expect("site")
                .cell
                .is_none(),
            "cell below its oxygen threshold must die"
        );
        // The debit landed before death: 4.0 - 1.0 * 2.0, then one diffusion
        // pass pulls the level toward the neighborhood mean rather than
        // restoring the consumed amount.
        let level = world.grid().site(4, 4).expect("site").nutrient.oxygen.level;
        assert!(level < 100.0);
    }

    #[test]
    fn history_is_bounded_by_its_capacity() {
        let mut config = test_config();
        config.history_capacity = 4;
        let mut world = PetriWorld::new(config).expect("world");
        for _ in 0..10 {
            world.step();
        }
        let metrics: Vec<_> = world.history().collect();
        assert_eq!(metrics.len(), 4);
        assert_eq!(metrics[0].step, Step(7));
        assert_eq!(metrics[3].step, Step(10));
    }

    #[test]
    fn empty_world_steps_produce_zero_metrics() {
        let mut world = PetriWorld::new(test_config()).expect("world");
        match world.step() {
            StepOutcome::Stepped(metrics) => {
                assert_eq!(metrics.step, Step(1));
                assert_eq!(metrics.total, 0);
                assert_eq!(metrics.clusters, ClusterReport::default());
            }
            StepOutcome::Expanded { .. } => panic!("empty world must not expand"),
        }
        assert_eq!(world.current_step(), Step(1));
    }
}
