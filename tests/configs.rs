//! The example configurations in `configs/` must stay loadable.

use std::path::PathBuf;

use pbf_fluids::{
    assert_ft_approx_eq,
    scene::SceneType,
    simulation_parameters::{load_scene_config, load_simulation_params, SceneConfig, SimulationParams},
};

fn config_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs").join(name)
}

#[test]
fn test_simulation_config_matches_defaults() {
    let params = load_simulation_params(&config_path("simulation.yaml"), None).unwrap();
    let defaults = SimulationParams::default();
    params.validate().unwrap();

    assert_eq!(params.num_iterations, defaults.num_iterations);
    let pairs = [
        (params.time_step, defaults.time_step),
        (params.particle_radius, defaults.particle_radius),
        (params.kernel_radius, defaults.kernel_radius),
        (params.rest_density, defaults.rest_density),
        (params.gravity[1], defaults.gravity[1]),
        (params.epsilon_cfm, defaults.epsilon_cfm),
        (params.xsph_viscosity, defaults.xsph_viscosity),
        (params.s_corr, defaults.s_corr),
        (params.vorticity_epsilon, defaults.vorticity_epsilon),
    ];
    for (a, b) in pairs.iter() {
        assert_ft_approx_eq(*a, *b, b.abs() * 1e-6, || "simulation.yaml".to_string());
    }
}

#[test]
fn test_overwrite_config_replaces_values() {
    let params = load_simulation_params(
        &config_path("simulation.yaml"),
        Some(&config_path("overwrite-more-iterations.yaml")),
    )
    .unwrap();
    assert_eq!(params.num_iterations, 8);
    assert_ft_approx_eq(params.time_step, 0.004, 1e-9, || "time_step".to_string());
    assert_ft_approx_eq(params.rest_density, 6378., 1e-3, || "rest_density".to_string());
}

#[test]
fn test_scene_configs_match_centered_layouts() {
    let radius = SimulationParams::default().particle_radius;
    for (file, scene_type) in [
        ("scene-block.yaml", SceneType::Block),
        ("scene-billow.yaml", SceneType::Billow),
        ("scene-spout.yaml", SceneType::Spout),
    ]
    .iter()
    {
        let scene = load_scene_config(&config_path(file)).unwrap();
        scene.validate().unwrap();

        let expected = SceneConfig::centered(*scene_type, [20, 40, 20], radius);
        assert_eq!(scene.scene_type, expected.scene_type);
        assert_eq!(scene.fluid_size, expected.fluid_size);
        assert_eq!(scene.container_size, expected.container_size);
        for d in 0..3 {
            assert!((scene.container_corner_position[d] - expected.container_corner_position[d]).abs() < 1e-4);
        }
    }
}

#[test]
fn test_missing_config_file_is_an_error() {
    let err = load_scene_config(&config_path("does-not-exist.yaml")).unwrap_err();
    assert!(err.to_string().contains("does-not-exist.yaml"));
}
