//! Property-based tests for the PBF solver using proptest
//!
//! These tests check invariants that must hold for arbitrary inputs:
//! - antisymmetry of the spiky kernel gradient
//! - fluid positions stay in the clamp box after position prediction
//! - particle counts are conserved by stepping
//! - results do not depend on the number of worker threads

use pbf_fluids::{
    floating_type_mod::FT, scene::SceneType, simulation_parameters::SceneConfig,
    simulation_parameters::SimulationParams, sph_kernels::SphKernel, vec3f, FluidSimulation, V3,
};
use proptest::prelude::*;

const KERNEL_RADIUS: FT = 0.1;
const MAX_INJECTED_VELOCITY: FT = 50.;
const MAX_STIRRING_VELOCITY: FT = 2.;

fn block_simulation(fluid_size: [i32; 3]) -> FluidSimulation {
    let params = SimulationParams::default();
    let scene = SceneConfig::centered(SceneType::Block, fluid_size, params.particle_radius);
    FluidSimulation::new(params, scene, false)
}

/// Relative positions strictly inside the kernel support, away from the center
fn position_in_support() -> impl Strategy<Value = V3> {
    (-1.0f64..1.0, -1.0f64..1.0, -1.0f64..1.0)
        .prop_map(|(x, y, z)| vec3f(x as FT, y as FT, z as FT) * (KERNEL_RADIUS * 0.577))
        .prop_filter("too close to the center", |r| r.norm() > 1.0e-4)
}

fn velocity(max: FT) -> impl Strategy<Value = V3> {
    (-1.0f64..1.0, -1.0f64..1.0, -1.0f64..1.0).prop_map(move |(x, y, z)| vec3f(x as FT, y as FT, z as FT) * max)
}

fn velocities(n: usize, max: FT) -> impl Strategy<Value = Vec<V3>> {
    prop::collection::vec(velocity(max), n)
}

fn run_in_pool(num_threads: usize, initial_velocities: &[V3], steps: usize) -> (Vec<V3>, Vec<V3>) {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .unwrap();

    pool.install(|| {
        let mut sim = block_simulation([3, 3, 3]);
        sim.fluid_velocities_mut().copy_from_slice(initial_velocities);
        sim.pause();
        for _ in 0..steps {
            sim.step();
        }
        (sim.fluid_positions().to_vec(), sim.fluid_velocities().to_vec())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: grad W(x_i - x_j) = -grad W(x_j - x_i)
    #[test]
    fn test_spiky_gradient_is_antisymmetric(r in position_in_support()) {
        let kernel = SphKernel::new(KERNEL_RADIUS);
        let a = kernel.spiky_grad(r);
        let b = kernel.spiky_grad(-r);
        prop_assert_eq!(a, -b);
        prop_assert!(a.norm() > 0.);
    }

    /// Property: the container clamp holds for arbitrary velocities
    #[test]
    fn test_predicted_positions_in_bounds(v in velocities(8, MAX_INJECTED_VELOCITY)) {
        let mut sim = block_simulation([2, 2, 2]);
        sim.fluid_velocities_mut().copy_from_slice(&v);
        sim.apply_gravity();
        sim.predict_positions();

        let (position_min, position_max) = sim.position_bounds();
        for (i, p) in sim.fluid_positions().iter().enumerate() {
            for d in 0..3 {
                prop_assert!(
                    p[d] >= position_min[d] && p[d] <= position_max[d],
                    "particle {} at {:?} outside of [{:?}, {:?}]", i, p, position_min, position_max
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Property: stepping never adds or removes particles
    #[test]
    fn test_particle_count_conserved(v in velocities(8, MAX_INJECTED_VELOCITY), steps in 1usize..6) {
        let mut sim = block_simulation([2, 2, 2]);
        let num_fluid = sim.num_fluid_particles();
        let num_boundary = sim.num_boundary_particles();

        sim.fluid_velocities_mut().copy_from_slice(&v);
        sim.pause();
        for _ in 0..steps {
            sim.step();
        }

        prop_assert_eq!(sim.num_fluid_particles(), num_fluid);
        prop_assert_eq!(sim.num_boundary_particles(), num_boundary);
        prop_assert_eq!(sim.fluid_positions().len(), num_fluid);
        prop_assert_eq!(sim.boundary_positions().len(), num_boundary);
        prop_assert_eq!(sim.fluid_velocities().len(), num_fluid);
    }

    /// Property: one worker thread and many worker threads give the same result
    #[test]
    fn test_thread_count_does_not_change_results(v in velocities(27, MAX_STIRRING_VELOCITY)) {
        let (single_positions, single_velocities) = run_in_pool(1, &v, 3);
        let (multi_positions, multi_velocities) = run_in_pool(4, &v, 3);

        for i in 0..single_positions.len() {
            prop_assert!(
                (single_positions[i] - multi_positions[i]).norm() <= 1.0e-6,
                "position {} differs: {:?} vs {:?}", i, single_positions[i], multi_positions[i]
            );
            prop_assert!(
                (single_velocities[i] - multi_velocities[i]).norm() <= 1.0e-4,
                "velocity {} differs: {:?} vs {:?}", i, single_velocities[i], multi_velocities[i]
            );
        }
    }
}

#[test]
fn test_reset_is_deterministic() {
    let mut sim = block_simulation([4, 3, 2]);
    let initial = sim.fluid_positions().to_vec();
    let boundary = sim.boundary_positions().to_vec();

    sim.pause();
    sim.step();
    sim.reset();
    let first = sim.fluid_positions().to_vec();
    sim.reset();
    let second = sim.fluid_positions().to_vec();

    assert_eq!(first, initial);
    assert_eq!(second, initial);
    assert_eq!(sim.boundary_positions(), &boundary[..]);
}

#[test]
fn test_every_scene_layout_has_finite_boundary_weights() {
    let params = SimulationParams::default();
    for scene_type in [SceneType::Block, SceneType::Billow, SceneType::Spout].iter() {
        let scene = SceneConfig::centered(*scene_type, [4, 4, 4], params.particle_radius);
        let sim = FluidSimulation::new(params, scene, false);
        assert!(sim.num_fluid_particles() > 0);
        assert!(sim.boundary_psi().iter().all(|psi| psi.is_finite() && *psi > 0.));
    }
}
