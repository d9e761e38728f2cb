//! Stochastic simulation of discrete reaction networks using the
//! next-reaction method: each reaction carries its own exponentially
//! distributed next-fire time, a priority queue picks the earliest one, and
//! only the reactions whose propensity the firing actually changed are
//! rescheduled.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{self, Write};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Token separating reactants from products in the reaction grammar.
const REACTANT_PRODUCT_SEPARATOR: &str = "->";
/// Prefix introducing a species index in the reaction grammar.
const SPECIES_TOKEN: char = 'S';
/// Column separator for rendered trajectory rows.
pub const DELIMITER: &str = "\t";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("malformed reaction syntax: {0}")]
    MalformedReactionSyntax(String),
    #[error("insufficient input data: {0}")]
    InsufficientInputData(String),
    #[error("negative population: {0}")]
    NegativePopulation(String),
}

/// One species occurrence in a reaction: a 0-based species index and a
/// positive stoichiometric coefficient. The text grammar writes species
/// 1-based (`S1` is species 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReactionTerm {
    pub species: usize,
    pub coefficient: u32,
}

/// A reaction as produced by a loader: reactant terms, product terms and a
/// non-negative rate constant. Terms may repeat a species; they are merged
/// by summing coefficients when the model is built.
#[derive(Clone, Debug, PartialEq)]
pub struct ReactionDef {
    pub reactants: Vec<ReactionTerm>,
    pub products: Vec<ReactionTerm>,
    pub rate_constant: f64,
}

/// Everything one simulation needs: reactions, the initial population of
/// every species (its length declares the species count), the time horizon,
/// and the 0-based indices of the species whose trajectories are reported.
#[derive(Clone, Debug)]
pub struct SimulationInput {
    pub reaction_defs: Vec<ReactionDef>,
    pub initial_populations: Vec<i64>,
    pub horizon: f64,
    pub watched_species: Vec<usize>,
}

/// Net population change a firing applies to one species.
#[derive(Clone, Copy, Debug)]
struct SpeciesDelta {
    species: usize,
    delta: i64,
}

/// Immutable reaction record. Per-replicate state (propensity, next-fire
/// time, fire count) lives in [`ReactionState`]; firing is performed by the
/// engine through the precomputed `deltas`, never by the reaction itself.
#[derive(Clone, Debug)]
struct Reaction {
    reactants: Vec<ReactionTerm>,
    products: Vec<ReactionTerm>,
    rate_constant: f64,
    deltas: Vec<SpeciesDelta>,
}

impl Reaction {
    /// Mass-action propensity: the rate constant times, for each reactant
    /// term with coefficient k, the falling factorial
    /// `pop * (pop-1) * … * (pop-k+1)`. This counts distinct molecule
    /// combinations, so a homo-reaction like `2S1 -> …` scales with
    /// `n*(n-1)` rather than `n²`. Zero whenever any reactant lacks the
    /// molecules its coefficient requires.
    fn propensity(&self, populations: &[i64]) -> f64 {
        let mut propensity = self.rate_constant;
        for term in &self.reactants {
            let available = populations[term.species];
            if available < term.coefficient as i64 {
                return 0.0;
            }
            propensity *= falling_factorial(available, term.coefficient);
        }
        propensity
    }
}

#[inline]
fn falling_factorial(value: i64, count: u32) -> f64 {
    if value < count as i64 {
        return 0.0;
    }
    let mut product = 1.0;
    for step in 0..count as i64 {
        product *= (value - step) as f64;
    }
    product
}

/// Draw the time offset until a reaction's next firing. The uniform sample
/// is taken from (0, 1] via `1.0 - gen()`, so the logarithm never sees 0.
/// A zero propensity yields `horizon + 1.0`, a key no live firing can reach
/// before the horizon; the reaction stays queued but can never win.
fn draw_offset(propensity: f64, horizon: f64, rng: &mut ChaCha8Rng) -> f64 {
    if propensity <= 0.0 {
        return horizon + 1.0;
    }
    let u: f64 = 1.0 - rng.r#gen::<f64>();
    -u.ln() / propensity
}

/// Merge repeated species on one side of a reaction by summing coefficients,
/// keeping first-appearance order.
fn merge_terms(terms: Vec<ReactionTerm>) -> Vec<ReactionTerm> {
    let mut merged: Vec<ReactionTerm> = Vec::with_capacity(terms.len());
    for term in terms {
        match merged.iter_mut().find(|t| t.species == term.species) {
            Some(existing) => existing.coefficient += term.coefficient,
            None => merged.push(term),
        }
    }
    merged
}

fn net_deltas(reactants: &[ReactionTerm], products: &[ReactionTerm]) -> Vec<SpeciesDelta> {
    let mut deltas: Vec<SpeciesDelta> = Vec::new();
    let mut apply = |species: usize, amount: i64| {
        match deltas.iter_mut().find(|d| d.species == species) {
            Some(existing) => existing.delta += amount,
            None => deltas.push(SpeciesDelta {
                species,
                delta: amount,
            }),
        }
    };
    for term in reactants {
        apply(term.species, -(term.coefficient as i64));
    }
    for term in products {
        apply(term.species, term.coefficient as i64);
    }
    deltas.retain(|d| d.delta != 0);
    deltas
}

#[derive(Debug)]
struct Model {
    reactions: Vec<Reaction>,
    dependencies: DependencyGraph,
}

impl Model {
    fn new(defs: Vec<ReactionDef>, n_species: usize) -> Result<Self, SimError> {
        let mut reactions = Vec::with_capacity(defs.len());
        for (idx, def) in defs.into_iter().enumerate() {
            for term in def.reactants.iter().chain(def.products.iter()) {
                if term.species >= n_species {
                    return Err(SimError::MalformedReactionSyntax(format!(
                        "reaction {} references species S{} beyond the declared range 1..={}",
                        idx + 1,
                        term.species + 1,
                        n_species
                    )));
                }
                if term.coefficient == 0 {
                    return Err(SimError::MalformedReactionSyntax(format!(
                        "reaction {} has a zero coefficient for species S{}",
                        idx + 1,
                        term.species + 1
                    )));
                }
            }
            if !(def.rate_constant >= 0.0) {
                return Err(SimError::MalformedReactionSyntax(format!(
                    "reaction {} rate constant must be a non-negative number",
                    idx + 1
                )));
            }
            let reactants = merge_terms(def.reactants);
            let products = merge_terms(def.products);
            let deltas = net_deltas(&reactants, &products);
            reactions.push(Reaction {
                reactants,
                products,
                rate_constant: def.rate_constant,
                deltas,
            });
        }
        let dependencies = DependencyGraph::build(n_species, &reactions);
        Ok(Self {
            reactions,
            dependencies,
        })
    }
}

/// Static reaction → dependent-reactions map: after a reaction fires, only
/// its dependents need their propensity recomputed. Built once per model,
/// queried on every firing, never mutated.
#[derive(Debug)]
struct DependencyGraph {
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Two phases, O(total term occurrences): index species → reactions
    /// consuming that species, then for each reaction take the union of
    /// that index over every species its terms touch. The reaction itself
    /// always leads its own set. The stamp array dedups without clearing
    /// a seen-buffer between reactions.
    fn build(n_species: usize, reactions: &[Reaction]) -> Self {
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n_species];
        for (idx, reaction) in reactions.iter().enumerate() {
            for term in &reaction.reactants {
                consumers[term.species].push(idx);
            }
        }

        let mut dependents = vec![Vec::new(); reactions.len()];
        let mut visit_markers = vec![0usize; reactions.len()];
        for (r, deps) in dependents.iter_mut().enumerate() {
            let mark = r + 1;
            visit_markers[r] = mark;
            deps.push(r);
            for term in reactions[r]
                .reactants
                .iter()
                .chain(reactions[r].products.iter())
            {
                for &dep in &consumers[term.species] {
                    if visit_markers[dep] != mark {
                        visit_markers[dep] = mark;
                        deps.push(dep);
                    }
                }
            }
        }
        Self { dependents }
    }

    fn dependents_of(&self, reaction: usize) -> &[usize] {
        &self.dependents[reaction]
    }
}

#[derive(Clone, Copy, Debug)]
struct ScheduledFiring {
    time: f64,
    reaction: usize,
    generation: u64,
}

impl PartialEq for ScheduledFiring {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledFiring {}

impl PartialOrd for ScheduledFiring {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledFiring {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.reaction.cmp(&other.reaction))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

/// Min-heap of pending firings keyed by absolute next-fire time. Keys move
/// both up and down: `schedule` bumps the reaction's generation and pushes a
/// fresh entry, and `pop_next` discards entries whose generation is stale,
/// which is remove-then-reinsert without touching the heap's interior.
#[derive(Default)]
struct FiringQueue {
    heap: BinaryHeap<Reverse<ScheduledFiring>>,
    generations: Vec<u64>,
}

impl FiringQueue {
    fn reset(&mut self, n_reactions: usize) {
        self.heap.clear();
        self.generations.clear();
        self.generations.resize(n_reactions, 0);
    }

    fn schedule(&mut self, reaction: usize, time: f64) {
        self.generations[reaction] += 1;
        self.heap.push(Reverse(ScheduledFiring {
            time,
            reaction,
            generation: self.generations[reaction],
        }));
    }

    fn pop_next(&mut self) -> Option<(usize, f64)> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if self.generations[entry.reaction] == entry.generation {
                return Some((entry.reaction, entry.time));
            }
        }
        None
    }
}

/// Per-replicate derived state of one reaction. The next-fire time itself
/// lives in the queue; a zero propensity here marks the queued entry as the
/// sentinel.
#[derive(Clone, Copy, Debug, Default)]
struct ReactionState {
    propensity: f64,
    fire_count: u64,
}

/// Mutable state of one replicate, reused across runs on the same worker.
#[derive(Default)]
struct ReplicateScratch {
    populations: Vec<i64>,
    states: Vec<ReactionState>,
    queue: FiringQueue,
}

impl ReplicateScratch {
    /// Restore the initial populations, zero every fire counter, recompute
    /// every propensity and next-fire time from the initial state with
    /// fresh draws, and rebuild the queue.
    fn reset(&mut self, model: &Model, initial: &[i64], horizon: f64, rng: &mut ChaCha8Rng) {
        self.populations.clear();
        self.populations.extend_from_slice(initial);
        self.states.clear();
        self.states
            .resize(model.reactions.len(), ReactionState::default());
        self.queue.reset(model.reactions.len());
        for (idx, reaction) in model.reactions.iter().enumerate() {
            let propensity = reaction.propensity(&self.populations);
            self.states[idx] = ReactionState {
                propensity,
                fire_count: 0,
            };
            self.queue.schedule(idx, draw_offset(propensity, horizon, rng));
        }
    }
}

thread_local! {
    static REPLICATE_SCRATCH: RefCell<ReplicateScratch> = RefCell::new(ReplicateScratch::default());
}

/// Why a replicate stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// The next firing would have met or exceeded the horizon.
    HorizonReached,
    /// Nothing could ever fire again before the horizon.
    Stalled,
}

/// Watched populations at one point in a trajectory.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryRow {
    pub time: f64,
    pub populations: Vec<i64>,
}

/// Outcome of one replicate: the watched-species snapshot at termination,
/// how often each reaction fired, and the recorded trajectory rows (one per
/// firing that changed a watched species).
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicateResult {
    pub final_populations: Vec<i64>,
    pub fire_counts: Vec<u64>,
    pub final_time: f64,
    pub termination: TerminationReason,
    pub rows: Vec<TrajectoryRow>,
}

/// A validated reaction network plus initial conditions, ready to run any
/// number of independent replicates. Replicates share the immutable model
/// and each own their mutable state and RNG, so they may run in parallel.
#[derive(Debug)]
pub struct Ensemble {
    model: Model,
    initial_populations: Vec<i64>,
    horizon: f64,
    watched: Vec<usize>,
    watched_mask: Vec<bool>,
}

impl Ensemble {
    pub fn new(input: SimulationInput) -> Result<Self, SimError> {
        let n_species = input.initial_populations.len();
        for (idx, &population) in input.initial_populations.iter().enumerate() {
            if population < 0 {
                return Err(SimError::NegativePopulation(format!(
                    "initial population for species S{} is {}",
                    idx + 1,
                    population
                )));
            }
        }
        for &species in &input.watched_species {
            if species >= n_species {
                return Err(SimError::MalformedReactionSyntax(format!(
                    "output species S{} is beyond the declared range 1..={}",
                    species + 1,
                    n_species
                )));
            }
        }
        let model = Model::new(input.reaction_defs, n_species)?;
        let mut watched_mask = vec![false; n_species];
        for &species in &input.watched_species {
            watched_mask[species] = true;
        }
        info!(
            n_species,
            n_reactions = model.reactions.len(),
            horizon = input.horizon,
            "built simulation ensemble"
        );
        Ok(Self {
            model,
            initial_populations: input.initial_populations,
            horizon: input.horizon,
            watched: input.watched_species,
            watched_mask,
        })
    }

    pub fn n_reactions(&self) -> usize {
        self.model.reactions.len()
    }

    /// Run a single replicate with the caller's RNG.
    pub fn run_replicate(&self, rng: &mut ChaCha8Rng) -> Result<ReplicateResult, SimError> {
        let mut scratch = ReplicateScratch::default();
        self.run_with_scratch(&mut scratch, rng)
    }

    /// Run `n` replicates sequentially. Replicate `i` runs on its own RNG
    /// stream derived from `seed`, so the results are identical to the
    /// parallel runner's.
    pub fn run_replicates(&self, n: usize, seed: u64) -> Result<Vec<ReplicateResult>, SimError> {
        let mut scratch = ReplicateScratch::default();
        (0..n)
            .map(|replicate| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, replicate as u64));
                self.run_with_scratch(&mut scratch, &mut rng)
            })
            .collect()
    }

    /// Run `n` replicates across the rayon pool. Each worker reuses a
    /// thread-local scratch; aggregation stays exact because summaries are
    /// built from per-replicate results, not per-worker averages.
    pub fn run_replicates_parallel(
        &self,
        n: usize,
        seed: u64,
    ) -> Result<Vec<ReplicateResult>, SimError> {
        (0..n)
            .into_par_iter()
            .map(|replicate| {
                REPLICATE_SCRATCH.with(|cell| {
                    let mut scratch = cell.borrow_mut();
                    let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(seed, replicate as u64));
                    self.run_with_scratch(&mut scratch, &mut rng)
                })
            })
            .collect()
    }

    /// Drive one replicate from reset to termination.
    ///
    /// Each step extracts the earliest pending firing. A sentinel entry at
    /// the front means nothing can fire before the horizon, so the replicate
    /// stalls where it stands; a live entry at or past the horizon ends the
    /// replicate without firing. Otherwise the clock jumps to the firing,
    /// the reaction's net deltas are applied (one write per species, so a
    /// species on both sides never shows a transient negative count), and
    /// every dependent reaction is rescheduled from a fresh draw.
    fn run_with_scratch(
        &self,
        scratch: &mut ReplicateScratch,
        rng: &mut ChaCha8Rng,
    ) -> Result<ReplicateResult, SimError> {
        scratch.reset(&self.model, &self.initial_populations, self.horizon, rng);
        let mut time = 0.0_f64;
        let mut rows = Vec::new();

        let termination = loop {
            let Some((reaction_id, next_fire)) = scratch.queue.pop_next() else {
                break TerminationReason::Stalled;
            };
            if scratch.states[reaction_id].propensity == 0.0 {
                warn!(time, "no reaction can fire before the horizon; replicate stalled");
                break TerminationReason::Stalled;
            }
            if next_fire >= self.horizon {
                break TerminationReason::HorizonReached;
            }
            time = next_fire;

            let reaction = &self.model.reactions[reaction_id];
            let mut watched_changed = false;
            for delta in &reaction.deltas {
                let updated = scratch.populations[delta.species] + delta.delta;
                if updated < 0 {
                    return Err(SimError::NegativePopulation(format!(
                        "species S{} driven to {} by reaction {}",
                        delta.species + 1,
                        updated,
                        reaction_id + 1
                    )));
                }
                scratch.populations[delta.species] = updated;
                watched_changed |= self.watched_mask[delta.species];
            }
            scratch.states[reaction_id].fire_count += 1;

            for &dep in self.model.dependencies.dependents_of(reaction_id) {
                let propensity = self.model.reactions[dep].propensity(&scratch.populations);
                scratch.states[dep].propensity = propensity;
                scratch
                    .queue
                    .schedule(dep, time + draw_offset(propensity, self.horizon, rng));
            }

            if watched_changed {
                rows.push(TrajectoryRow {
                    time,
                    populations: self.watched.iter().map(|&s| scratch.populations[s]).collect(),
                });
            }
        };

        let fire_counts: Vec<u64> = scratch.states.iter().map(|s| s.fire_count).collect();
        debug!(
            ?termination,
            time,
            firings = fire_counts.iter().sum::<u64>(),
            "replicate finished"
        );
        Ok(ReplicateResult {
            final_populations: self.watched.iter().map(|&s| scratch.populations[s]).collect(),
            fire_counts,
            final_time: time,
            termination,
            rows,
        })
    }
}

/// SplitMix64 over the base seed and replicate index: well-spread,
/// deterministic per-replicate RNG streams that are independent of how
/// replicates are distributed over workers.
fn derive_seed(base: u64, replicate: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let z = (base ^ replicate.wrapping_mul(GOLDEN_GAMMA)).wrapping_add(GOLDEN_GAMMA);
    let mut mixed = z;
    mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D049BB133111EB);
    mixed ^ (mixed >> 31)
}

/// Running (count, Σx, Σx²) over integer observations. Partial accumulators
/// merge exactly, so parallel workers can each keep their own and combine
/// at the end without averaging averages.
#[derive(Clone, Copy, Debug, Default)]
pub struct MomentAccumulator {
    count: u64,
    sum: i128,
    sum_sq: i128,
}

impl MomentAccumulator {
    pub fn record(&mut self, value: i64) {
        self.count += 1;
        self.sum += value as i128;
        self.sum_sq += (value as i128) * (value as i128);
    }

    pub fn merge(&mut self, other: &MomentAccumulator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Population variance, `Σ(x − mean)² / n` with divisor n, computed as
    /// `Σx²/n − mean²` over the exact integer sums.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.mean();
        (self.sum_sq as f64 / n - mean * mean).max(0.0)
    }
}

/// Mean and population variance of one watched species across replicates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpeciesSummary {
    pub mean: f64,
    pub variance: f64,
}

/// Per-watched-species moments over the final populations of a set of
/// replicate results.
pub fn summarize(results: &[ReplicateResult]) -> Vec<SpeciesSummary> {
    let n_watched = results
        .first()
        .map(|r| r.final_populations.len())
        .unwrap_or(0);
    let mut accumulators = vec![MomentAccumulator::default(); n_watched];
    for result in results {
        for (acc, &value) in accumulators.iter_mut().zip(result.final_populations.iter()) {
            acc.record(value);
        }
    }
    accumulators
        .iter()
        .map(|acc| SpeciesSummary {
            mean: acc.mean(),
            variance: acc.variance(),
        })
        .collect()
}

fn parse_term(token: &str, n_species: usize) -> Result<ReactionTerm, SimError> {
    let Some((prefix, index_digits)) = token.split_once(SPECIES_TOKEN) else {
        return Err(SimError::MalformedReactionSyntax(format!(
            "token '{token}' does not reference a species"
        )));
    };
    if index_digits.is_empty() || !index_digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SimError::MalformedReactionSyntax(format!(
            "token '{token}' has no species index after '{SPECIES_TOKEN}'"
        )));
    }
    let coefficient = if prefix.is_empty() {
        1
    } else {
        if !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SimError::MalformedReactionSyntax(format!(
                "token '{token}' has a non-numeric coefficient"
            )));
        }
        prefix.parse::<u32>().map_err(|_| {
            SimError::MalformedReactionSyntax(format!("coefficient in '{token}' is out of range"))
        })?
    };
    if coefficient == 0 {
        return Err(SimError::MalformedReactionSyntax(format!(
            "coefficient in '{token}' must be positive"
        )));
    }
    let number = index_digits.parse::<usize>().map_err(|_| {
        SimError::MalformedReactionSyntax(format!("species index in '{token}' is out of range"))
    })?;
    if number == 0 || number > n_species {
        return Err(SimError::MalformedReactionSyntax(format!(
            "species index in '{token}' is outside the declared range 1..={n_species}"
        )));
    }
    Ok(ReactionTerm {
        species: number - 1,
        coefficient,
    })
}

/// Parse one reaction line. The grammar is whitespace-separated tokens: an
/// optional positive coefficient immediately followed by `S` and a 1-based
/// species index per term (`2S1`, `S2`), reactants and products separated by
/// the literal token `->`, and the rate constant as the token immediately
/// after the separator. Repeated species on one side merge by summing
/// coefficients. Either side may be empty (pure birth or pure decay).
pub fn parse_reaction(text: &str, n_species: usize) -> Result<ReactionDef, SimError> {
    let mut reactants = Vec::new();
    let mut products = Vec::new();
    let mut rate_constant = None;
    let mut seen_separator = false;

    for token in text.split_whitespace() {
        if !seen_separator && token == REACTANT_PRODUCT_SEPARATOR {
            seen_separator = true;
            continue;
        }
        if seen_separator && rate_constant.is_none() {
            let rate = token.parse::<f64>().map_err(|_| {
                SimError::MalformedReactionSyntax(format!(
                    "rate constant '{token}' is not a number"
                ))
            })?;
            if !(rate >= 0.0) {
                return Err(SimError::MalformedReactionSyntax(format!(
                    "rate constant '{token}' must be non-negative"
                )));
            }
            rate_constant = Some(rate);
            continue;
        }
        let term = parse_term(token, n_species)?;
        if seen_separator {
            products.push(term);
        } else {
            reactants.push(term);
        }
    }

    if !seen_separator {
        return Err(SimError::MalformedReactionSyntax(format!(
            "missing '{REACTANT_PRODUCT_SEPARATOR}' in '{}'",
            text.trim()
        )));
    }
    let rate_constant = rate_constant.ok_or_else(|| {
        SimError::MalformedReactionSyntax(format!(
            "missing rate constant after '{REACTANT_PRODUCT_SEPARATOR}' in '{}'",
            text.trim()
        ))
    })?;

    Ok(ReactionDef {
        reactants: merge_terms(reactants),
        products: merge_terms(products),
        rate_constant,
    })
}

fn render_term(term: &ReactionTerm) -> String {
    if term.coefficient == 1 {
        format!("{SPECIES_TOKEN}{}", term.species + 1)
    } else {
        format!("{}{SPECIES_TOKEN}{}", term.coefficient, term.species + 1)
    }
}

/// Render a reaction back into the text grammar. Reparsing the result gives
/// back an equal [`ReactionDef`].
pub fn render_reaction(def: &ReactionDef) -> String {
    let mut tokens: Vec<String> = def.reactants.iter().map(render_term).collect();
    tokens.push(REACTANT_PRODUCT_SEPARATOR.to_string());
    tokens.push(format!("{}", def.rate_constant));
    tokens.extend(def.products.iter().map(render_term));
    tokens.join(" ")
}

/// Parse a full input deck.
///
/// Layout (blank lines ignored): a header `N M D T` declaring the species
/// count, reaction count, output-species count and time horizon; a line of
/// N initial populations; a line of D 1-based output species indices; then
/// M reaction lines in the grammar of [`parse_reaction`]. Extra values on
/// the population and index lines are ignored.
pub fn parse_deck(text: &str) -> Result<SimulationInput, SimError> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| SimError::InsufficientInputData("missing header line".into()))?;
    let fields: Vec<&str> = header.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(SimError::InsufficientInputData(format!(
            "header requires 4 values (species, reactions, output species, horizon), found {}",
            fields.len()
        )));
    }
    let n_species = parse_count(fields[0], "species count")?;
    let n_reactions = parse_count(fields[1], "reaction count")?;
    let n_watched = parse_count(fields[2], "output species count")?;
    let horizon = fields[3].parse::<f64>().map_err(|_| {
        SimError::MalformedReactionSyntax(format!("horizon '{}' is not a number", fields[3]))
    })?;
    if !horizon.is_finite() || horizon <= 0.0 {
        return Err(SimError::MalformedReactionSyntax(format!(
            "horizon must be a positive number, got '{}'",
            fields[3]
        )));
    }

    let population_line = lines
        .next()
        .ok_or_else(|| SimError::InsufficientInputData("missing population line".into()))?;
    let population_fields: Vec<&str> = population_line.split_whitespace().collect();
    if population_fields.len() < n_species {
        return Err(SimError::InsufficientInputData(format!(
            "expected {} initial populations, found {}",
            n_species,
            population_fields.len()
        )));
    }
    let mut initial_populations = Vec::with_capacity(n_species);
    for (idx, field) in population_fields.iter().take(n_species).enumerate() {
        let population = field.parse::<i64>().map_err(|_| {
            SimError::MalformedReactionSyntax(format!(
                "initial population '{field}' is not an integer"
            ))
        })?;
        if population < 0 {
            return Err(SimError::NegativePopulation(format!(
                "initial population for species S{} is {}",
                idx + 1,
                population
            )));
        }
        initial_populations.push(population);
    }

    let watched_line = lines
        .next()
        .ok_or_else(|| SimError::InsufficientInputData("missing output species line".into()))?;
    let watched_fields: Vec<&str> = watched_line.split_whitespace().collect();
    if watched_fields.len() < n_watched {
        return Err(SimError::InsufficientInputData(format!(
            "expected {} output species indices, found {}",
            n_watched,
            watched_fields.len()
        )));
    }
    let mut watched_species = Vec::with_capacity(n_watched);
    for field in watched_fields.iter().take(n_watched) {
        let number = field.parse::<usize>().map_err(|_| {
            SimError::MalformedReactionSyntax(format!(
                "output species index '{field}' is not an integer"
            ))
        })?;
        if number == 0 || number > n_species {
            return Err(SimError::MalformedReactionSyntax(format!(
                "output species index {number} is outside the declared range 1..={n_species}"
            )));
        }
        watched_species.push(number - 1);
    }

    let mut reaction_defs = Vec::with_capacity(n_reactions);
    for idx in 0..n_reactions {
        let line = lines.next().ok_or_else(|| {
            SimError::InsufficientInputData(format!(
                "expected {n_reactions} reaction lines, found {idx}"
            ))
        })?;
        reaction_defs.push(parse_reaction(line, n_species)?);
    }

    info!(n_species, n_reactions, horizon, "parsed input deck");
    Ok(SimulationInput {
        reaction_defs,
        initial_populations,
        horizon,
        watched_species,
    })
}

fn parse_count(field: &str, what: &str) -> Result<usize, SimError> {
    field.parse::<usize>().map_err(|_| {
        SimError::MalformedReactionSyntax(format!("{what} '{field}' is not an integer"))
    })
}

/// Write one `time<TAB>value…` line per recorded row.
pub fn write_trajectory_rows<W: Write>(out: &mut W, rows: &[TrajectoryRow]) -> io::Result<()> {
    for row in rows {
        write!(out, "{}", row.time)?;
        for value in &row.populations {
            write!(out, "{DELIMITER}{value}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Write one fire count per line, in reaction order.
pub fn write_fire_counts<W: Write>(out: &mut W, fire_counts: &[u64]) -> io::Result<()> {
    for count in fire_counts {
        writeln!(out, "{count}")?;
    }
    Ok(())
}

/// Write the ensemble summary: a `mean(xI) = value` line per watched
/// species followed by a `varI = value` line per watched species, I being
/// the 1-based position in the watched list.
pub fn write_summary<W: Write>(out: &mut W, summaries: &[SpeciesSummary]) -> io::Result<()> {
    for (idx, summary) in summaries.iter().enumerate() {
        writeln!(out, "mean(x{}) = {}", idx + 1, summary.mean)?;
    }
    for (idx, summary) in summaries.iter().enumerate() {
        writeln!(out, "var{} = {}", idx + 1, summary.variance)?;
    }
    Ok(())
}
