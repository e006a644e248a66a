use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    floating_type_mod::{FT, PI},
    scene::SceneType,
    sph_kernels::SphKernel,
    IT, V3, VI3,
};

/// Fluid particles are spheres of diameter `2 * particle_radius`: m = rho_0 * PI/6 * d^3.
pub const MASS_FACTOR: FT = PI / 6.;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub time_step: FT,
    pub particle_radius: FT,
    pub kernel_radius: FT,
    pub rest_density: FT,
    pub gravity: [FT; 3],

    // Jacobi iterations of the density constraint per step
    pub num_iterations: usize,

    // constraint force mixing, keeps the lambda denominator away from zero
    pub epsilon_cfm: FT,

    // XSPH viscosity coefficient "c"
    pub xsph_viscosity: FT,

    // artificial pressure, added as a flat constant to every fluid-fluid/fluid-boundary pair
    pub s_corr: FT,

    pub vorticity_epsilon: FT,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            time_step: 0.0083,
            particle_radius: 0.03345,
            kernel_radius: 0.1,
            rest_density: 6378.,
            gravity: [0., -9.80665, 0.],
            num_iterations: 4,
            epsilon_cfm: 600.,
            xsph_viscosity: 0.000001,
            s_corr: -0.0016,
            vorticity_epsilon: 1.0e-6,
        }
    }
}

impl SimulationParams {
    pub fn gravity_vector(&self) -> V3 {
        V3::from(self.gravity)
    }

    /// The solver itself accepts any value; this is meant for drivers reading user input.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("time_step", self.time_step),
            ("particle_radius", self.particle_radius),
            ("kernel_radius", self.kernel_radius),
            ("rest_density", self.rest_density),
        ];
        for (name, value) in positive.iter() {
            if !(*value > 0.) {
                return Err(ConfigError::Invalid(format!("{} must be positive (got {})", name, value)));
            }
        }
        if !(self.epsilon_cfm >= 0.) {
            return Err(ConfigError::Invalid(format!(
                "epsilon_cfm must not be negative (got {})",
                self.epsilon_cfm
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub scene_type: SceneType,

    // in particles
    pub fluid_size: [IT; 3],
    // offset of the fluid block from the inner container corner
    pub fluid_corner_position: [FT; 3],

    // inner extent in particles (the boundary layer is added around it)
    pub container_size: [IT; 3],
    pub container_corner_position: [FT; 3],
}

impl Default for SceneConfig {
    fn default() -> Self {
        SceneConfig::centered(
            SceneType::Block,
            [20, 40, 20],
            SimulationParams::default().particle_radius,
        )
    }
}

impl SceneConfig {
    /**
     * Container centered around the y axis, sized relative to the fluid block
     * so that the chosen layout has room to flow.
     */
    pub fn centered(scene_type: SceneType, fluid_size: [IT; 3], particle_radius: FT) -> SceneConfig {
        let particle_diameter = 2. * particle_radius;
        let [fx, fy, fz] = fluid_size;

        let depth_factor: FT = match scene_type {
            SceneType::Block => 1.,
            SceneType::Billow => 1.5,
            SceneType::Spout => 2.,
        };
        let container_size = [3 * fx, 3 * fy, (depth_factor * fz as FT) as IT];

        let container_corner_position = [
            -0.5 * container_size[0] as FT * particle_diameter,
            0.,
            -0.5 * container_size[2] as FT * particle_diameter,
        ];

        SceneConfig {
            scene_type,
            fluid_size,
            fluid_corner_position: [0., 0., 0.],
            container_size,
            container_corner_position,
        }
    }

    pub fn fluid_size(&self) -> VI3 {
        VI3::from(self.fluid_size)
    }

    pub fn fluid_corner_position(&self) -> V3 {
        V3::from(self.fluid_corner_position)
    }

    pub fn container_size(&self) -> VI3 {
        VI3::from(self.container_size)
    }

    pub fn container_corner_position(&self) -> V3 {
        V3::from(self.container_corner_position)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fluid_size.iter().any(|&x| x < 0) {
            return Err(ConfigError::Invalid(format!(
                "fluid_size must not be negative (got {:?})",
                self.fluid_size
            )));
        }
        if self.container_size.iter().any(|&x| x < 1) {
            return Err(ConfigError::Invalid(format!(
                "container_size must be at least one particle in every direction (got {:?})",
                self.container_size
            )));
        }
        Ok(())
    }
}

/**
 * Values derived from `SimulationParams`, computed once per reset and read by
 * every phase of a step.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConstants {
    pub inv_time_step: FT,
    pub particle_diameter: FT,
    pub neighbor_distance: FT,
    pub neighbor_distance_sq: FT,
    pub mass: FT,
    pub inv_rest_density: FT,
    pub inv_rest_density_sq: FT,
    pub gravity: V3,
    pub kernel: SphKernel,
}

impl SolverConstants {
    pub fn new(params: &SimulationParams) -> SolverConstants {
        let particle_diameter = 2. * params.particle_radius;
        let neighbor_distance = 4. * params.particle_radius;
        let inv_rest_density = 1. / params.rest_density;

        SolverConstants {
            // a zero time step is not rejected here
            inv_time_step: 1. / params.time_step,
            particle_diameter,
            neighbor_distance,
            neighbor_distance_sq: neighbor_distance * neighbor_distance,
            mass: params.rest_density * MASS_FACTOR * particle_diameter * particle_diameter * particle_diameter,
            inv_rest_density,
            inv_rest_density_sq: inv_rest_density * inv_rest_density,
            gravity: params.gravity_vector(),
            kernel: SphKernel::new(params.kernel_radius),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(serde_yaml::Error),
    UnknownKey(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "failed to access `{}`: {}", path.display(), e),
            ConfigError::Yaml(e) => write!(f, "failed to parse configuration: {}", e),
            ConfigError::UnknownKey(k) => write!(f, "not able to find attribute `{}`", k),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Yaml(e)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
}

/**
 * Parses simulation parameters. Every key of the optional `overwrite_yaml`
 * mapping replaces the value of an existing key in `params_yaml`.
 */
pub fn parse_simulation_params(params_yaml: &str, overwrite_yaml: Option<&str>) -> Result<SimulationParams, ConfigError> {
    let mut simulation_params_serde: serde_yaml::Value = serde_yaml::from_str(params_yaml)?;

    if let Some(overwrite_yaml) = overwrite_yaml {
        let overwrite_values: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(overwrite_yaml)?;
        let mapping = simulation_params_serde
            .as_mapping_mut()
            .ok_or_else(|| ConfigError::Invalid("simulation parameters must be a mapping".to_string()))?;
        for (k, v) in overwrite_values.into_iter() {
            match mapping.get_mut(&serde_yaml::Value::String(k.clone())) {
                Some(entry) => *entry = v,
                None => return Err(ConfigError::UnknownKey(k)),
            }
        }
    }

    Ok(serde_yaml::from_value(simulation_params_serde)?)
}

pub fn load_simulation_params(path: &Path, overwrite_path: Option<&Path>) -> Result<SimulationParams, ConfigError> {
    let params_yaml = read_file(path)?;
    let overwrite_yaml = match overwrite_path {
        Some(overwrite_path) => Some(read_file(overwrite_path)?),
        None => None,
    };
    parse_simulation_params(&params_yaml, overwrite_yaml.as_deref())
}

pub fn load_scene_config(path: &Path) -> Result<SceneConfig, ConfigError> {
    load_yaml(path)
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    Ok(serde_yaml::from_str(&read_file(path)?)?)
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(value)?;
    std::fs::write(path, yaml).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
}

#[test]
fn solver_constants_from_default_params() {
    let params = SimulationParams::default();
    let constants = SolverConstants::new(&params);

    crate::assert_ft_approx_eq(constants.particle_diameter, 0.0669, 1e-6, || "diameter".to_string());
    crate::assert_ft_approx_eq(constants.neighbor_distance, 0.1338, 1e-6, || "neighbor distance".to_string());
    assert!(constants.neighbor_distance > constants.particle_diameter);
    crate::assert_ft_approx_eq(constants.inv_time_step, 1. / 0.0083, 1e-2, || "inverse dt".to_string());

    // 6378 * PI/6 * 0.0669^3
    crate::assert_ft_approx_eq(constants.mass, 0.99991, 1e-3, || "mass".to_string());
    assert_eq!(constants.kernel, SphKernel::new(0.1));
}

#[test]
fn zero_time_step_is_not_rejected_by_the_solver() {
    let params = SimulationParams {
        time_step: 0.,
        ..SimulationParams::default()
    };
    assert!(SolverConstants::new(&params).inv_time_step.is_infinite());
    assert!(params.validate().is_err());
}

#[test]
fn centered_scene_matches_layout() {
    let radius = 0.03345;
    let d = 2. * radius;

    let block = SceneConfig::centered(SceneType::Block, [20, 40, 20], radius);
    assert_eq!(block.container_size, [60, 120, 20]);
    crate::assert_ft_approx_eq(block.container_corner_position[0], -30. * d, 1e-5, || "corner x".to_string());
    assert_eq!(block.container_corner_position[1], 0.);
    crate::assert_ft_approx_eq(block.container_corner_position[2], -10. * d, 1e-5, || "corner z".to_string());

    let billow = SceneConfig::centered(SceneType::Billow, [3, 3, 3], radius);
    assert_eq!(billow.container_size, [9, 9, 4]);

    let spout = SceneConfig::centered(SceneType::Spout, [20, 40, 20], radius);
    assert_eq!(spout.container_size, [60, 120, 40]);
}

#[test]
fn overwrite_replaces_existing_keys_only() {
    let base = serde_yaml::to_string(&SimulationParams::default()).unwrap();

    let params = parse_simulation_params(&base, Some("num_iterations: 7\ns_corr: -0.002\n")).unwrap();
    assert_eq!(params.num_iterations, 7);
    crate::assert_ft_approx_eq(params.s_corr, -0.002, 1e-9, || "s_corr".to_string());
    assert_eq!(params.rest_density, 6378.);

    match parse_simulation_params(&base, Some("no_such_key: 1\n")) {
        Err(ConfigError::UnknownKey(k)) => assert_eq!(k, "no_such_key"),
        other => panic!("expected unknown key error, got {:?}", other),
    }
}

#[test]
fn scene_config_roundtrips_through_yaml() {
    let scene = SceneConfig::centered(SceneType::Spout, [4, 5, 6], 0.05);
    let yaml = serde_yaml::to_string(&scene).unwrap();
    let parsed: SceneConfig = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(parsed, scene);
    assert!(parsed.validate().is_ok());

    let broken = SceneConfig {
        container_size: [0, 4, 4],
        ..scene
    };
    assert!(broken.validate().is_err());
}
