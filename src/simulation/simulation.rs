use std::fmt::Display;

use log::{debug, info, log_enabled, trace, Level};
use num_traits::Float;

#[cfg(not(target_arch = "wasm32"))]
use rayon::iter::ParallelIterator;

use crate::{
    boundary_handler::ParticleBasedBoundaryHandler,
    concurrency::{into_par_iter, par_iter_mut1, par_iter_mut2},
    floating_type_mod::FT,
    neighborhood_search::{CellGrid, GridGeometry, NeighborhoodCache},
    particles::{FluidParticleVec, ParticleId, ParticleRanges},
    scene::create_particles,
    simulation_parameters::{SceneConfig, SimulationParams, SolverConstants},
    statistics::{write_counters, PerformanceCounters, ValueCounters},
    V3,
};

#[cfg(test)]
use crate::vec3f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Paused,
    Running,
}

/// Minimum `|eta|` for which vorticity confinement is applied.
pub const MIN_VORTICITY_LOCATION_NORM: FT = 1.0e-6;

fn end_iteration_timer(pcounters: &mut PerformanceCounters, id: &str, iteration: usize) {
    if iteration == 0 {
        pcounters.end(id);
    } else {
        pcounters.end_add_to_last(id);
    }
}

#[inline(always)]
fn neighbor_mass(ranges: ParticleRanges, mass: FT, psi: &[FT], j: usize) -> FT {
    match ranges.classify(j) {
        ParticleId::Fluid(_) => mass,
        ParticleId::Boundary(b) => psi[b],
    }
}

/// Moves a coordinate that left `[min, max]` one particle diameter back inside
/// and reflects the velocity component with half its magnitude.
#[inline(always)]
fn clamp_to_container(p: &mut V3, v: &mut V3, position_min: V3, position_max: V3, particle_diameter: FT) {
    for d in 0..3 {
        if p[d] < position_min[d] {
            p[d] = position_min[d] + particle_diameter;
            v[d] *= -0.5;
        } else if p[d] > position_max[d] {
            p[d] = position_max[d] - particle_diameter;
            v[d] *= -0.5;
        }
    }
}

/**
 * Position Based Fluids (Macklin and Müller 2013) with static particle boundaries.
 *
 * All particles share one index space: `[0, num_fluid)` are fluid particles,
 * `[num_fluid, num_particles)` are boundary particles. Only the fluid part is
 * ever written by a step. Every phase is a separate parallel loop, so each phase
 * reads the complete output of the previous one (Jacobi updates).
 */
pub struct FluidSimulation {
    params: SimulationParams,
    scene_config: SceneConfig,
    state: SimulationState,

    constants: SolverConstants,
    ranges: ParticleRanges,
    position_min: V3,
    position_max: V3,

    // positions of all particles, boundary particles at the end
    pub position: Vec<V3>,
    pub particles: FluidParticleVec,
    pub boundary_handler: ParticleBasedBoundaryHandler,

    grid_geometry: GridGeometry,
    fluid_grid: CellGrid,
    pub neighs: NeighborhoodCache,

    time: FT,
    step_number: usize,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,
}

impl FluidSimulation {
    /// Creates the particles of `scene_config`. The simulation starts paused.
    pub fn new(params: SimulationParams, scene_config: SceneConfig, counters_enabled: bool) -> Self {
        Self::init(
            params,
            scene_config,
            PerformanceCounters::new(counters_enabled),
            ValueCounters::new(counters_enabled),
        )
    }

    fn init(
        params: SimulationParams,
        scene_config: SceneConfig,
        pcounters: PerformanceCounters,
        vcounters: ValueCounters,
    ) -> Self {
        let constants = SolverConstants::new(&params);

        let layout = create_particles(&scene_config, params.particle_radius);
        let ranges = layout.ranges;
        let position = layout.positions;

        let grid_geometry = GridGeometry::new(constants.neighbor_distance, layout.domain_min, layout.domain_max);

        let mut neighs = NeighborhoodCache::new(ranges.num_particles());
        let boundary_handler = ParticleBasedBoundaryHandler::new(
            &grid_geometry,
            &position,
            ranges,
            &mut neighs,
            &constants.kernel,
            constants.neighbor_distance_sq,
            params.rest_density,
        );

        let mut particles = FluidParticleVec::default(ranges.num_fluid);
        particles.last_position.copy_from_slice(&position[ranges.fluid()]);

        info!(
            "reset {:?} scene: {} fluid particles, {} boundary particles, {} grid cells ({}x{}x{}), particle mass {}",
            scene_config.scene_type,
            ranges.num_fluid,
            ranges.num_boundary,
            grid_geometry.num_cells(),
            grid_geometry.size().x,
            grid_geometry.size().y,
            grid_geometry.size().z,
            constants.mass,
        );

        FluidSimulation {
            params,
            scene_config,
            state: SimulationState::Paused,
            constants,
            ranges,
            position_min: layout.position_min,
            position_max: layout.position_max,
            position,
            particles,
            boundary_handler,
            fluid_grid: CellGrid::new(&grid_geometry),
            grid_geometry,
            neighs,
            time: 0.,
            step_number: 0,
            pcounters,
            vcounters,
        }
    }

    /// Rebuilds everything from the current configuration and pauses. Counters are kept.
    pub fn reset(&mut self) {
        let pcounters = std::mem::replace(&mut self.pcounters, PerformanceCounters::new(false));
        let vcounters = std::mem::replace(&mut self.vcounters, ValueCounters::new(false));
        *self = Self::init(self.params, self.scene_config, pcounters, vcounters);
    }

    pub fn reconfigure(&mut self, params: SimulationParams, scene_config: SceneConfig) {
        self.params = params;
        self.scene_config = scene_config;
        self.reset();
    }

    /// Toggles between paused and running.
    pub fn pause(&mut self) {
        self.state = match self.state {
            SimulationState::Paused => SimulationState::Running,
            SimulationState::Running => SimulationState::Paused,
        };
    }

    /// Advances by one time step if running. Returns whether a step was taken.
    pub fn step(&mut self) -> bool {
        if self.state == SimulationState::Paused {
            return false;
        }
        self.advance();
        true
    }

    /// One full time step, ignoring the pause state.
    pub fn advance(&mut self) {
        self.pcounters.begin("simulation-step");

        self.pcounters.begin("gravity");
        self.apply_gravity();
        self.pcounters.end("gravity");

        self.pcounters.begin("predict");
        self.predict_positions();
        self.pcounters.end("predict");

        self.pcounters.begin("neighborhood");
        self.update_neighborhoods();
        self.pcounters.end("neighborhood");

        self.solve_density_constraints();

        self.pcounters.begin("velocity");
        self.update_velocities();
        self.pcounters.end("velocity");

        self.pcounters.begin("vorticity");
        self.apply_vorticity_confinement();
        self.pcounters.end("vorticity");

        self.pcounters.begin("viscosity");
        self.apply_xsph_viscosity();
        self.pcounters.end("viscosity");

        self.pcounters.end("simulation-step");

        self.time += self.params.time_step;
        self.step_number += 1;

        if self.vcounters.enabled() {
            let density_error = self.mean_density_error();
            self.vcounters.add_value("density-error", density_error);
            self.vcounters.add_value("particle-count", self.ranges.num_fluid as FT);
            debug!(
                "step {} (t={:.4}s): mean density error {:.5}",
                self.step_number, self.time, density_error
            );
        } else {
            debug!("step {} (t={:.4}s)", self.step_number, self.time);
        }
    }

    pub fn apply_gravity(&mut self) {
        let dt_gravity = self.params.time_step * self.constants.gravity;
        par_iter_mut1(&mut self.particles.velocity, |_i, v| {
            *v += dt_gravity;
        });
    }

    /// Explicit Euler position update followed by the container clamp.
    pub fn predict_positions(&mut self) {
        let dt = self.params.time_step;
        let position_min = self.position_min;
        let position_max = self.position_max;
        let particle_diameter = self.constants.particle_diameter;

        par_iter_mut2(
            &mut self.position[self.ranges.fluid()],
            &mut self.particles.velocity,
            |_i, p, v| {
                *p += dt * *v;
                clamp_to_container(p, v, position_min, position_max, particle_diameter);
            },
        );
    }

    /// Rebins the fluid particles and rebuilds the fluid neighbor lists against
    /// the fluid and the boundary grid.
    pub fn update_neighborhoods(&mut self) {
        self.fluid_grid
            .rebuild(&self.grid_geometry, &self.position, self.ranges.fluid());

        self.neighs.build_neighborhood_list_grid(
            &self.grid_geometry,
            &self.position,
            self.ranges.fluid(),
            &[&self.fluid_grid, self.boundary_handler.grid()],
            self.constants.neighbor_distance_sq,
        );

        if self.vcounters.enabled() {
            let neighs = &self.neighs;
            let num_fluid = self.ranges.num_fluid.max(1);
            let neighbor_count = into_par_iter(self.ranges.fluid())
                .map(|i| neighs.neighbor_count(i) as FT)
                .sum::<FT>()
                / num_fluid as FT;
            self.vcounters.add_value("neighbor-count", neighbor_count);
        }
    }

    pub fn solve_density_constraints(&mut self) {
        for iteration in 0..self.params.num_iterations {
            self.density_constraint_iteration(iteration);

            if log_enabled!(Level::Trace) {
                trace!(
                    "step {} iteration {}: mean density error {:.5}",
                    self.step_number,
                    iteration,
                    self.mean_density_error()
                );
            }
        }
    }

    /// density, lambda, position correction and its application; each a separate pass
    ///
    /// The phase timers of all iterations of a step add up to one sample.
    pub fn density_constraint_iteration(&mut self, iteration: usize) {
        let psi = &self.boundary_handler.psi;

        self.pcounters.begin("density");
        Self::calculate_densities(
            &self.constants,
            self.ranges,
            &self.position,
            psi,
            &self.neighs,
            &mut self.particles.density,
        );
        end_iteration_timer(&mut self.pcounters, "density", iteration);

        self.pcounters.begin("lambda");
        Self::calculate_lambdas(
            &self.params,
            &self.constants,
            self.ranges,
            &self.position,
            psi,
            &self.neighs,
            &self.particles.density,
            &mut self.particles.lambda,
        );
        end_iteration_timer(&mut self.pcounters, "lambda", iteration);

        self.pcounters.begin("correction");
        Self::calculate_position_corrections(
            &self.params,
            &self.constants,
            self.ranges,
            &self.position,
            psi,
            &self.neighs,
            &self.particles.lambda,
            &mut self.particles.delta_position,
        );

        let delta_position = &self.particles.delta_position;
        par_iter_mut1(&mut self.position[self.ranges.fluid()], |i, p| {
            *p += delta_position[i];
        });
        end_iteration_timer(&mut self.pcounters, "correction", iteration);
    }

    pub fn calculate_densities(
        constants: &SolverConstants,
        ranges: ParticleRanges,
        position: &[V3],
        psi: &[FT],
        neighs: &NeighborhoodCache,
        density: &mut [FT],
    ) {
        let kernel = &constants.kernel;
        par_iter_mut1(density, |i, rho| {
            let xi = position[i];
            let mut sum: FT = 0.;
            for j in neighs.iter(i) {
                sum += neighbor_mass(ranges, constants.mass, psi, j) * kernel.poly6(xi - position[j]);
            }
            *rho = sum;
        });
    }

    pub fn calculate_lambdas(
        params: &SimulationParams,
        constants: &SolverConstants,
        ranges: ParticleRanges,
        position: &[V3],
        psi: &[FT],
        neighs: &NeighborhoodCache,
        density: &[FT],
        lambda: &mut [FT],
    ) {
        let kernel = &constants.kernel;
        par_iter_mut1(lambda, |i, lambda_i| {
            let xi = position[i];

            // gradient of the constraint with respect to x_i, without the 1/rho_0 factor
            let mut grad_sum = V3::zeros();
            let mut grad_sq_sum: FT = 0.;
            for j in neighs.iter(i) {
                let grad = neighbor_mass(ranges, constants.mass, psi, j) * kernel.spiky_grad(xi - position[j]);
                grad_sum += grad;
                grad_sq_sum += grad.norm_squared();
            }

            *lambda_i = (1. - density[i] * constants.inv_rest_density)
                / (constants.inv_rest_density_sq * (grad_sq_sum + grad_sum.norm_squared()) + params.epsilon_cfm);
        });
    }

    /// `s_corr` is added as a constant, not as the distance dependent tensile term.
    pub fn calculate_position_corrections(
        params: &SimulationParams,
        constants: &SolverConstants,
        ranges: ParticleRanges,
        position: &[V3],
        psi: &[FT],
        neighs: &NeighborhoodCache,
        lambda: &[FT],
        delta_position: &mut [V3],
    ) {
        let kernel = &constants.kernel;
        let s_corr = params.s_corr;
        par_iter_mut1(delta_position, |i, dp| {
            let xi = position[i];
            let lambda_i = lambda[i];

            let mut sum = V3::zeros();
            for j in neighs.iter(i) {
                let grad = kernel.spiky_grad(xi - position[j]);
                match ranges.classify(j) {
                    ParticleId::Fluid(j) => sum += (lambda_i + lambda[j] + s_corr) * constants.mass * grad,
                    ParticleId::Boundary(b) => sum += (lambda_i + s_corr) * psi[b] * grad,
                }
            }

            *dp = sum * constants.inv_rest_density;
        });
    }

    pub fn update_velocities(&mut self) {
        let inv_time_step = self.constants.inv_time_step;
        let position = &self.position;
        par_iter_mut2(
            &mut self.particles.velocity,
            &mut self.particles.last_position,
            |i, v, last_position| {
                *v = (position[i] - *last_position) * inv_time_step;
                *last_position = position[i];
            },
        );
    }

    /// Two passes: all `delta_velocity` values are computed from the unmodified
    /// velocity field before any of them is applied.
    pub fn apply_vorticity_confinement(&mut self) {
        Self::calculate_vorticity_confinement(
            &self.params,
            &self.constants,
            self.ranges,
            &self.position,
            &self.particles.velocity,
            &self.neighs,
            &mut self.particles.delta_velocity,
        );
        self.apply_delta_velocity();
    }

    pub fn calculate_vorticity_confinement(
        params: &SimulationParams,
        constants: &SolverConstants,
        ranges: ParticleRanges,
        position: &[V3],
        velocity: &[V3],
        neighs: &NeighborhoodCache,
        delta_velocity: &mut [V3],
    ) {
        let kernel = &constants.kernel;
        let vorticity_epsilon = params.vorticity_epsilon;

        par_iter_mut1(delta_velocity, |i, dv| {
            let xi = position[i];
            let vi = velocity[i];

            let mut num_fluid_neighbors: FT = 0.;
            let mut eta = V3::zeros();
            let mut omega = V3::zeros();
            for j in neighs.iter(i) {
                if let ParticleId::Fluid(j) = ranges.classify(j) {
                    eta += position[j];
                    omega += (velocity[j] - vi).cross(&kernel.spiky_grad(position[j] - xi));
                    num_fluid_neighbors += 1.;
                }
            }

            let eta = (eta - xi * num_fluid_neighbors) * 0.5;
            let eta_norm = eta.norm();
            *dv = if eta_norm > MIN_VORTICITY_LOCATION_NORM {
                (eta / eta_norm).cross(&omega) * vorticity_epsilon
            } else {
                V3::zeros()
            };
        });
    }

    /// Same two pass structure as the vorticity confinement.
    pub fn apply_xsph_viscosity(&mut self) {
        Self::calculate_xsph_viscosity(
            &self.params,
            &self.constants,
            self.ranges,
            &self.position,
            &self.particles.velocity,
            &self.particles.density,
            &self.neighs,
            &mut self.particles.delta_velocity,
        );
        self.apply_delta_velocity();
    }

    pub fn calculate_xsph_viscosity(
        params: &SimulationParams,
        constants: &SolverConstants,
        ranges: ParticleRanges,
        position: &[V3],
        velocity: &[V3],
        density: &[FT],
        neighs: &NeighborhoodCache,
        delta_velocity: &mut [V3],
    ) {
        let kernel = &constants.kernel;
        let factor = params.xsph_viscosity * constants.mass;

        par_iter_mut1(delta_velocity, |i, dv| {
            let xi = position[i];
            let vi = velocity[i];

            let mut sum = V3::zeros();
            for j in neighs.iter(i) {
                if let ParticleId::Fluid(j) = ranges.classify(j) {
                    sum += (velocity[j] - vi) * (kernel.poly6(xi - position[j]) / density[j]);
                }
            }

            *dv = sum * factor;
        });
    }

    fn apply_delta_velocity(&mut self) {
        let delta_velocity = &self.particles.delta_velocity;
        par_iter_mut1(&mut self.particles.velocity, |i, v| {
            *v += delta_velocity[i];
        });
    }

    /// Mean of `|rho_i / rho_0 - 1|` over the fluid particles.
    pub fn mean_density_error(&self) -> FT {
        if self.ranges.num_fluid == 0 {
            return 0.;
        }
        let density = &self.particles.density;
        let inv_rest_density = self.constants.inv_rest_density;
        into_par_iter(self.ranges.fluid())
            .map(|i| (density[i] * inv_rest_density - 1.).abs())
            .sum::<FT>()
            / self.ranges.num_fluid as FT
    }

    /// Index of the first fluid particle whose position is NaN or infinite.
    pub fn first_non_finite_fluid_particle(&self) -> Option<usize> {
        self.fluid_positions()
            .iter()
            .position(|p| p.iter().any(|x| !x.is_finite()))
    }

    pub fn fluid_positions(&self) -> &[V3] {
        &self.position[self.ranges.fluid()]
    }

    pub fn fluid_positions_mut(&mut self) -> &mut [V3] {
        &mut self.position[self.ranges.fluid()]
    }

    pub fn boundary_positions(&self) -> &[V3] {
        &self.position[self.ranges.boundary()]
    }

    pub fn fluid_velocities(&self) -> &[V3] {
        &self.particles.velocity
    }

    pub fn fluid_velocities_mut(&mut self) -> &mut [V3] {
        &mut self.particles.velocity
    }

    pub fn fluid_densities(&self) -> &[FT] {
        &self.particles.density
    }

    pub fn fluid_lambdas(&self) -> &[FT] {
        &self.particles.lambda
    }

    pub fn boundary_psi(&self) -> &[FT] {
        self.boundary_handler.psi()
    }

    pub fn num_fluid_particles(&self) -> usize {
        self.ranges.num_fluid
    }

    pub fn num_boundary_particles(&self) -> usize {
        self.ranges.num_boundary
    }

    pub fn num_particles(&self) -> usize {
        self.ranges.num_particles()
    }

    pub fn neighbors(&self, i: usize) -> impl Iterator<Item = ParticleId> + '_ {
        let ranges = self.ranges;
        self.neighs.iter(i).map(move |j| ranges.classify(j))
    }

    pub fn time(&self) -> FT {
        self.time
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state == SimulationState::Paused
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn scene_config(&self) -> &SceneConfig {
        &self.scene_config
    }

    pub fn constants(&self) -> &SolverConstants {
        &self.constants
    }

    /// Inclusive box the fluid positions are clamped to.
    pub fn position_bounds(&self) -> (V3, V3) {
        (self.position_min, self.position_max)
    }
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

pub fn write_statistics(fluid_simulation: &FluidSimulation) -> String {
    let mut s = format!(
        "steps: {}\nsimulated-time: {}s\nfluid-particles: {}\nboundary-particles: {}\n\n",
        fluid_simulation.step_number,
        fluid_simulation.time,
        fluid_simulation.ranges.num_fluid,
        fluid_simulation.ranges.num_boundary
    );
    s.push_str(&write_counters(&fluid_simulation.pcounters, &fluid_simulation.vcounters));
    s
}

#[cfg(test)]
fn small_block_simulation(counters_enabled: bool) -> FluidSimulation {
    use crate::scene::SceneType;

    let params = SimulationParams::default();
    let scene = SceneConfig::centered(SceneType::Block, [2, 2, 2], params.particle_radius);
    FluidSimulation::new(params, scene, counters_enabled)
}

#[test]
fn simulation_starts_paused_and_pause_toggles() {
    let mut sim = small_block_simulation(false);
    assert_eq!(sim.state(), SimulationState::Paused);

    let before = sim.fluid_positions().to_vec();
    assert!(!sim.step());
    assert_eq!(sim.fluid_positions(), &before[..]);
    assert_eq!(sim.step_number(), 0);

    sim.pause();
    assert_eq!(sim.state(), SimulationState::Running);
    assert!(sim.step());
    assert_eq!(sim.step_number(), 1);
    assert_ft_approx_eq(sim.time(), sim.params().time_step, 1e-7, || "time".to_string());

    sim.pause();
    assert!(sim.is_paused());
    assert!(!sim.step());
    assert_eq!(sim.step_number(), 1);
}

#[test]
fn gravity_is_applied_before_any_correction() {
    let mut sim = small_block_simulation(false);
    sim.apply_gravity();

    let expected = -9.80665 * 0.0083;
    for v in sim.fluid_velocities() {
        assert_ft_approx_eq(v.y, expected, 1e-6, || "velocity y after gravity".to_string());
        assert_eq!(v.x, 0.);
        assert_eq!(v.z, 0.);
    }
}

#[test]
fn step_keeps_fluid_inside_the_container() {
    let mut sim = small_block_simulation(false);
    let (position_min, position_max) = sim.position_bounds();
    let d = sim.constants().particle_diameter;

    sim.apply_gravity();
    sim.predict_positions();
    for p in sim.fluid_positions() {
        for k in 0..3 {
            assert!(p[k] >= position_min[k] && p[k] <= position_max[k]);
        }
    }

    sim.update_neighborhoods();
    sim.solve_density_constraints();
    sim.update_velocities();
    sim.apply_vorticity_confinement();
    sim.apply_xsph_viscosity();

    // container walls are one boundary layer around the clamp box
    for p in sim.fluid_positions() {
        for k in 0..3 {
            assert!(p[k] >= position_min[k] - d && p[k] <= position_max[k] + d, "{:?} left the container", p);
        }
    }
    assert!(sim.first_non_finite_fluid_particle().is_none());
}

#[test]
fn fluid_particles_are_their_own_neighbors() {
    let mut sim = small_block_simulation(false);
    sim.update_neighborhoods();
    for i in 0..sim.num_fluid_particles() {
        assert!(sim.neighbors(i).any(|id| id == ParticleId::Fluid(i)));
    }
    // the block rests on the bottom, so the lowest particles see the wall
    assert!(sim.neighbors(0).any(|id| matches!(id, ParticleId::Boundary(_))));
}

#[test]
fn isolated_particle_gets_no_correction() {
    let mut sim = small_block_simulation(false);
    sim.fluid_positions_mut()[0] = V3::repeat(1000.);
    sim.update_neighborhoods();
    assert_eq!(sim.neighs.neighbor_count(0), 0);

    sim.density_constraint_iteration(0);

    assert_eq!(sim.fluid_densities()[0], 0.);
    assert_eq!(sim.particles.delta_position[0], V3::zeros());
    assert_eq!(sim.fluid_positions()[0], V3::repeat(1000.));

    // lambda follows the formula with empty sums
    let lambda = sim.fluid_lambdas()[0];
    assert!(lambda.is_finite());
    assert_ft_approx_eq(lambda, 1. / sim.params().epsilon_cfm, 1e-9, || "lambda".to_string());
}

#[test]
fn boundary_particles_are_never_modified() {
    let mut sim = small_block_simulation(false);
    let boundary = sim.boundary_positions().to_vec();
    let psi = sim.boundary_psi().to_vec();

    sim.pause();
    for _ in 0..5 {
        sim.step();
    }

    assert_eq!(sim.boundary_positions(), &boundary[..]);
    assert_eq!(sim.boundary_psi(), &psi[..]);
    assert!(psi.iter().all(|psi| psi.is_finite() && *psi > 0.));
}

#[test]
fn reset_restores_the_initial_state() {
    let mut sim = small_block_simulation(false);
    let initial = sim.position.clone();
    let num_fluid = sim.num_fluid_particles();
    let num_boundary = sim.num_boundary_particles();

    sim.pause();
    for _ in 0..3 {
        sim.step();
    }
    assert_ne!(sim.position, initial);
    assert_eq!(sim.num_fluid_particles(), num_fluid);
    assert_eq!(sim.num_boundary_particles(), num_boundary);

    sim.reset();
    assert!(sim.is_paused());
    assert_eq!(sim.step_number(), 0);
    assert_eq!(sim.time(), 0.);
    assert_eq!(sim.position, initial);
    assert!(sim.fluid_velocities().iter().all(|v| *v == V3::zeros()));

    sim.reset();
    assert_eq!(sim.position, initial);
}

#[test]
fn reconfigure_changes_the_particle_set() {
    use crate::scene::SceneType;

    let mut sim = small_block_simulation(false);
    let params = *sim.params();
    sim.reconfigure(params, SceneConfig::centered(SceneType::Block, [3, 3, 3], params.particle_radius));
    assert_eq!(sim.num_fluid_particles(), 27);
    assert_eq!(sim.num_particles(), sim.position.len());
    assert_eq!(sim.neighs.len(), sim.num_particles());
}

#[test]
fn larger_block_runs_without_diverging() {
    use crate::scene::SceneType;

    let params = SimulationParams::default();
    let scene = SceneConfig::centered(SceneType::Block, [6, 6, 6], params.particle_radius);
    let mut sim = FluidSimulation::new(params, scene, true);
    sim.pause();
    for _ in 0..20 {
        sim.step();
    }

    assert!(sim.first_non_finite_fluid_particle().is_none());
    assert!(sim.fluid_velocities().iter().all(|v| v.iter().all(|x| x.is_finite())));
    assert!(sim.mean_density_error().is_finite());

    let report = write_statistics(&sim);
    assert!(report.contains("steps: 20"));
    assert!(report.contains("density-error: min:"));
    assert!(report.contains("neighbor-count: min:"));
    assert!(report.contains("lambda: avg:"));
}

#[test]
fn disabled_counters_produce_no_samples() {
    let mut sim = small_block_simulation(false);
    sim.pause();
    sim.step();
    let report = write_statistics(&sim);
    assert!(!report.contains("avg:"));
}

#[test]
fn constraint_timers_take_one_sample_per_step() {
    let mut sim = small_block_simulation(true);
    assert!(sim.params().num_iterations > 1);

    sim.pause();
    for _ in 0..3 {
        sim.step();
    }

    for id in ["density", "lambda", "correction", "gravity", "viscosity"].iter() {
        assert_eq!(sim.pcounters.get(id).map(|c| c.len()), Some(3), "samples of {}", id);
    }
}

/// Fluid particles first, then boundary particles with one shared psi. The
/// neighbor lists of the fluid particles are built against both grids.
#[cfg(test)]
struct HandPlacedParticles {
    constants: SolverConstants,
    ranges: ParticleRanges,
    position: Vec<V3>,
    psi: Vec<FT>,
    neighs: NeighborhoodCache,
}

#[cfg(test)]
impl HandPlacedParticles {
    fn new(params: &SimulationParams, fluid: &[V3], boundary: &[V3], psi: FT) -> Self {
        let constants = SolverConstants::new(params);
        let ranges = ParticleRanges::new(fluid.len(), boundary.len());
        let position: Vec<V3> = fluid.iter().chain(boundary.iter()).copied().collect();

        let geometry = GridGeometry::new(constants.neighbor_distance, V3::repeat(-0.5), V3::repeat(0.5));
        let mut fluid_grid = CellGrid::new(&geometry);
        fluid_grid.rebuild(&geometry, &position, ranges.fluid());
        let mut boundary_grid = CellGrid::new(&geometry);
        boundary_grid.rebuild(&geometry, &position, ranges.boundary());

        let mut neighs = NeighborhoodCache::new(ranges.num_particles());
        neighs.build_neighborhood_list_grid(
            &geometry,
            &position,
            ranges.fluid(),
            &[&fluid_grid, &boundary_grid],
            constants.neighbor_distance_sq,
        );

        HandPlacedParticles {
            constants,
            ranges,
            position,
            psi: vec![psi; boundary.len()],
            neighs,
        }
    }

    fn densities(&self) -> Vec<FT> {
        let mut density = vec![0.; self.ranges.num_fluid];
        FluidSimulation::calculate_densities(
            &self.constants,
            self.ranges,
            &self.position,
            &self.psi,
            &self.neighs,
            &mut density,
        );
        density
    }

    fn lambdas(&self, params: &SimulationParams, density: &[FT]) -> Vec<FT> {
        let mut lambda = vec![0.; self.ranges.num_fluid];
        FluidSimulation::calculate_lambdas(
            params,
            &self.constants,
            self.ranges,
            &self.position,
            &self.psi,
            &self.neighs,
            density,
            &mut lambda,
        );
        lambda
    }

    fn position_corrections(&self, params: &SimulationParams, lambda: &[FT]) -> Vec<V3> {
        let mut delta_position = vec![V3::zeros(); self.ranges.num_fluid];
        FluidSimulation::calculate_position_corrections(
            params,
            &self.constants,
            self.ranges,
            &self.position,
            &self.psi,
            &self.neighs,
            lambda,
            &mut delta_position,
        );
        delta_position
    }
}

#[cfg(test)]
fn assert_v3_approx_eq(a: V3, b: V3, relative_tolerance: FT, what: &str) {
    let tolerance = relative_tolerance * a.norm().max(b.norm());
    assert!(
        (a - b).norm() <= tolerance,
        "{} not equal with a tolerance of {}:\n\ta={:?}\n\tb={:?}\n",
        what,
        tolerance,
        a,
        b
    );
}

// two fluid particles and one boundary particle, all inside each other's kernel support
#[cfg(test)]
const TWO_FLUID_ONE_BOUNDARY: ([[FT; 3]; 2], [[FT; 3]; 1]) = ([[0., 0., 0.], [0.05, 0., 0.]], [[0., -0.06, 0.]]);

#[cfg(test)]
const BOUNDARY_PSI: FT = 2.;

#[cfg(test)]
fn two_fluid_one_boundary(params: &SimulationParams) -> HandPlacedParticles {
    let (fluid, boundary) = TWO_FLUID_ONE_BOUNDARY;
    let fluid: Vec<V3> = fluid.iter().map(|p| V3::from(*p)).collect();
    let boundary: Vec<V3> = boundary.iter().map(|p| V3::from(*p)).collect();
    HandPlacedParticles::new(params, &fluid, &boundary, BOUNDARY_PSI)
}

#[test]
fn density_weights_boundary_neighbors_by_psi() {
    let params = SimulationParams::default();
    let setup = two_fluid_one_boundary(&params);
    let kernel = &setup.constants.kernel;
    let m = setup.constants.mass;
    let x = &setup.position;

    assert_eq!(setup.neighs.neighbor_count(0), 3);
    let density = setup.densities();

    let expected0 = m * kernel.poly6(V3::zeros()) + m * kernel.poly6(x[0] - x[1]) + BOUNDARY_PSI * kernel.poly6(x[0] - x[2]);
    let expected1 = m * kernel.poly6(x[1] - x[0]) + m * kernel.poly6(V3::zeros()) + BOUNDARY_PSI * kernel.poly6(x[1] - x[2]);
    assert_ft_approx_eq(density[0], expected0, 1e-5 * expected0, || "density 0".to_string());
    assert_ft_approx_eq(density[1], expected1, 1e-5 * expected1, || "density 1".to_string());

    // the boundary term is not weighted by the fluid mass
    let fluid_weighted = expected0 + (m - BOUNDARY_PSI) * kernel.poly6(x[0] - x[2]);
    assert!((density[0] - fluid_weighted).abs() > 1e-3 * expected0);
}

#[test]
fn lambda_includes_the_squared_gradient_sum() {
    let params = SimulationParams::default();
    let setup = two_fluid_one_boundary(&params);
    let kernel = &setup.constants.kernel;
    let m = setup.constants.mass;
    let x = &setup.position;
    let inv_rho0 = 1. / params.rest_density;

    let density = setup.densities();
    let lambda = setup.lambdas(&params, &density);

    // the self gradient vanishes
    let g_fluid = m * kernel.spiky_grad(x[0] - x[1]);
    let g_boundary = BOUNDARY_PSI * kernel.spiky_grad(x[0] - x[2]);
    let grad_sum = g_fluid + g_boundary;
    let grad_sq_sum = g_fluid.norm_squared() + g_boundary.norm_squared();
    let constraint = 1. - density[0] * inv_rho0;

    let expected = constraint / (inv_rho0 * inv_rho0 * (grad_sq_sum + grad_sum.norm_squared()) + params.epsilon_cfm);
    assert_ft_approx_eq(lambda[0], expected, 1e-4 * expected.abs(), || "lambda 0".to_string());

    let without_sum = constraint / (inv_rho0 * inv_rho0 * grad_sq_sum + params.epsilon_cfm);
    assert!((lambda[0] - without_sum).abs() > 1e-3 * expected.abs());
}

#[test]
fn position_correction_adds_s_corr_to_every_pair() {
    let params = SimulationParams::default();
    let setup = two_fluid_one_boundary(&params);
    let kernel = &setup.constants.kernel;
    let m = setup.constants.mass;
    let x = &setup.position;
    let inv_rho0 = 1. / params.rest_density;

    let density = setup.densities();
    let lambda = setup.lambdas(&params, &density);

    let expected = |s_corr: FT| {
        ((lambda[0] + lambda[1] + s_corr) * m * kernel.spiky_grad(x[0] - x[1])
            + (lambda[0] + s_corr) * BOUNDARY_PSI * kernel.spiky_grad(x[0] - x[2]))
            * inv_rho0
    };

    let delta_position = setup.position_corrections(&params, &lambda);
    assert_v3_approx_eq(delta_position[0], expected(params.s_corr), 1e-4, "delta position 0");

    let without_s_corr = SimulationParams { s_corr: 0., ..params };
    let delta_position_without = setup.position_corrections(&without_s_corr, &lambda);
    assert_v3_approx_eq(delta_position_without[0], expected(0.), 1e-4, "delta position 0 without s_corr");

    let change = (delta_position[0] - delta_position_without[0]).norm();
    assert!(change > 1e-2 * expected(0.).norm(), "s_corr changed the correction by only {}", change);
}

#[test]
fn xsph_viscosity_blends_fluid_velocities() {
    let params = SimulationParams {
        xsph_viscosity: 0.01,
        ..SimulationParams::default()
    };
    let setup = two_fluid_one_boundary(&params);
    let kernel = &setup.constants.kernel;
    let m = setup.constants.mass;
    let x = &setup.position;

    let velocity = vec![vec3f(1., 0., 0.), vec3f(0., 0.5, 0.)];
    let density: Vec<FT> = vec![5000., 4000.];
    let mut delta_velocity = vec![V3::zeros(); 2];
    FluidSimulation::calculate_xsph_viscosity(
        &params,
        &setup.constants,
        setup.ranges,
        &setup.position,
        &velocity,
        &density,
        &setup.neighs,
        &mut delta_velocity,
    );

    // the boundary neighbor does not take part
    let c = params.xsph_viscosity;
    let expected0 = (velocity[1] - velocity[0]) * (c * m * kernel.poly6(x[0] - x[1]) / density[1]);
    let expected1 = (velocity[0] - velocity[1]) * (c * m * kernel.poly6(x[1] - x[0]) / density[0]);
    assert_v3_approx_eq(delta_velocity[0], expected0, 1e-5, "delta velocity 0");
    assert_v3_approx_eq(delta_velocity[1], expected1, 1e-5, "delta velocity 1");
}

#[test]
fn vorticity_confinement_follows_the_curl_of_a_shear_flow() {
    let params = SimulationParams {
        vorticity_epsilon: 0.1,
        ..SimulationParams::default()
    };
    let fluid = [vec3f(0., 0., 0.), vec3f(0.05, 0., 0.), vec3f(0., 0.05, 0.)];
    let setup = HandPlacedParticles::new(&params, &fluid, &[vec3f(0., -0.06, 0.)], BOUNDARY_PSI);
    let kernel = &setup.constants.kernel;

    // x velocity grows with y
    let velocity: Vec<V3> = fluid.iter().map(|p| vec3f(p.y * 20., 0., 0.)).collect();
    let mut delta_velocity = vec![V3::zeros(); fluid.len()];
    FluidSimulation::calculate_vorticity_confinement(
        &params,
        &setup.constants,
        setup.ranges,
        &setup.position,
        &velocity,
        &setup.neighs,
        &mut delta_velocity,
    );

    // only particle 2 moves relative to particle 0; the boundary particle is ignored
    let eta = ((fluid[1] - fluid[0]) + (fluid[2] - fluid[0])) * 0.5;
    let omega = (velocity[2] - velocity[0]).cross(&kernel.spiky_grad(fluid[2] - fluid[0]));
    let expected = eta.normalize().cross(&omega) * params.vorticity_epsilon;

    assert!(expected.norm() > 1.);
    assert_v3_approx_eq(delta_velocity[0], expected, 1e-4, "delta velocity 0");
}

#[test]
fn vorticity_confinement_needs_an_off_center_neighborhood() {
    let params = SimulationParams {
        vorticity_epsilon: 0.1,
        ..SimulationParams::default()
    };
    // particle 0 sits in the middle of its neighbors
    let fluid = [vec3f(0., 0., 0.), vec3f(-0.05, 0., 0.), vec3f(0.05, 0., 0.)];
    let setup = HandPlacedParticles::new(&params, &fluid, &[], BOUNDARY_PSI);
    let velocity = vec![V3::zeros(), vec3f(0., 1., 0.), vec3f(0., -1., 0.)];

    let mut delta_velocity = vec![V3::repeat(1.); fluid.len()];
    FluidSimulation::calculate_vorticity_confinement(
        &params,
        &setup.constants,
        setup.ranges,
        &setup.position,
        &velocity,
        &setup.neighs,
        &mut delta_velocity,
    );

    assert_eq!(delta_velocity[0], V3::zeros());
    // the outer particles see an off-center neighborhood
    assert!(delta_velocity[1].norm() > 0.);

    // a lone particle has eta = 0
    let lone = HandPlacedParticles::new(&params, &[vec3f(0.2, 0.2, 0.2)], &[], BOUNDARY_PSI);
    let mut lone_delta_velocity = vec![V3::repeat(1.)];
    FluidSimulation::calculate_vorticity_confinement(
        &params,
        &lone.constants,
        lone.ranges,
        &lone.position,
        &[vec3f(3., 0., 0.)],
        &lone.neighs,
        &mut lone_delta_velocity,
    );
    assert_eq!(lone_delta_velocity[0], V3::zeros());
}
