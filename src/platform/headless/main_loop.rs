use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{error, info, LevelFilter};

use crate::{
    floating_type_mod::FT,
    scene::SceneType,
    simulation_parameters::{
        load_scene_config, load_simulation_params, write_yaml, ConfigError, SceneConfig, SimulationParams,
    },
    write_statistics, FluidSimulation, IT,
};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

const DEFAULT_NUM_STEPS: usize = 100;
const DEFAULT_FLUID_SIZE: [IT; 3] = [20, 40, 20];

#[derive(Debug)]
enum DriverError {
    Config(ConfigError),
    Argument(String),
    Diverged { step: usize, particle: usize },
    Panicked { step: usize },
    Io(PathBuf, std::io::Error),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Config(e) => write!(f, "{}", e),
            DriverError::Argument(msg) => write!(f, "invalid argument: {}", msg),
            DriverError::Diverged { step, particle } => write!(
                f,
                "simulation diverged in step {}: fluid particle {} has a non-finite position",
                step, particle
            ),
            DriverError::Panicked { step } => write!(f, "simulation step {} panicked", step),
            DriverError::Io(path, e) => write!(f, "failed to write `{}`: {}", path.display(), e),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Config(e) => Some(e),
            DriverError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        DriverError::Config(e)
    }
}

pub fn start() {
    let matches = App::new("PBF Fluid Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation paramaters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_CONFIG")
                        .help("Scene setup")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("STEPS")
                        .long("steps")
                        .short("n")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given number of steps (default: 100)"),
                )
                .arg(
                    Arg::with_name("MAX_SECONDS")
                        .long("max-seconds")
                        .short("s")
                        .required(false)
                        .takes_value(true)
                        .help("Stop simulation after the given amount of simulated seconds"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .subcommand(
            SubCommand::with_name("default-config")
                .about("Write default simulation and scene configs")
                .arg(
                    Arg::with_name("SIMULATION_OUTPUT")
                        .help("YAML file where the simulation parameters are written to")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("SCENE_OUTPUT")
                        .help("YAML file where the scene setup is written to")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::with_name("SCENE_TYPE")
                        .long("scene-type")
                        .short("t")
                        .takes_value(true)
                        .possible_values(&["block", "billow", "spout"])
                        .help("Layout of the fluid particles"),
                )
                .arg(
                    Arg::with_name("FLUID_SIZE")
                        .long("fluid-size")
                        .short("f")
                        .takes_value(true)
                        .help("Fluid block size in particles as X,Y,Z (default: 20,40,20)"),
                ),
        )
        .get_matches();

    init_logger(matches.occurrences_of("v"));

    let result = if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)
    } else if let Some(subcmd_matches) = matches.subcommand_matches("default-config") {
        default_config(subcmd_matches)
    } else {
        unreachable!()
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` takes precedence over the `-v` flags.
fn init_logger(verbosity: u64) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, DriverError> {
    match matches.value_of(name) {
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|_| DriverError::Argument(format!("`{}` is not a valid value for {}", s, name))),
        None => Ok(None),
    }
}

fn parse_fluid_size(s: &str) -> Result<[IT; 3], DriverError> {
    let invalid = || DriverError::Argument(format!("fluid size `{}` must have the form X,Y,Z", s));

    let values = s
        .split(',')
        .map(|x| x.trim().parse::<IT>())
        .collect::<Result<Vec<IT>, _>>()
        .map_err(|_| invalid())?;

    match values[..] {
        [x, y, z] => Ok([x, y, z]),
        _ => Err(invalid()),
    }
}

fn parse_scene_type(s: &str) -> Result<SceneType, DriverError> {
    match s.to_lowercase().as_str() {
        "block" => Ok(SceneType::Block),
        "billow" => Ok(SceneType::Billow),
        "spout" => Ok(SceneType::Spout),
        _ => Err(DriverError::Argument(format!("unknown scene type `{}`", s))),
    }
}

fn run(run_matches: &ArgMatches) -> Result<(), DriverError> {
    let parameter_file = Path::new(run_matches.value_of("SIMULATION_CONFIG").unwrap_or_default());
    let overwrite_file = run_matches.value_of("OVERWRITE_CONFIG_FILE").map(Path::new);
    let simulation_params = load_simulation_params(parameter_file, overwrite_file)?;
    simulation_params.validate()?;
    info!("{:?}", simulation_params);

    let scene_file = Path::new(run_matches.value_of("SCENE_CONFIG").unwrap_or_default());
    let scene_config = load_scene_config(scene_file)?;
    scene_config.validate()?;
    info!("{:?}", scene_config);

    let max_seconds: Option<FT> = parse_arg(run_matches, "MAX_SECONDS")?;
    let max_steps: Option<usize> = parse_arg(run_matches, "STEPS")?;
    let max_steps = match (max_steps, max_seconds) {
        (None, None) => Some(DEFAULT_NUM_STEPS),
        (steps, _) => steps,
    };

    let counters_enabled = run_matches.is_present("STATISTICS_ENABLED");
    let statistics_path = run_matches.value_of("STATISTICS_PATH").map(PathBuf::from);

    let fluid_simulation = fluid_main(simulation_params, scene_config, max_steps, max_seconds, counters_enabled)?;

    if counters_enabled {
        let s = write_statistics(&fluid_simulation);
        print!("{}", s);
        if let Some(statistics_path) = statistics_path {
            std::fs::write(&statistics_path, s).map_err(|e| DriverError::Io(statistics_path.clone(), e))?;
            info!("statistics written to `{}`", statistics_path.display());
        }
    }

    Ok(())
}

fn fluid_main(
    simulation_params: SimulationParams,
    scene_config: SceneConfig,
    max_steps: Option<usize>,
    max_seconds: Option<FT>,
    counters_enabled: bool,
) -> Result<FluidSimulation, DriverError> {
    let mut fluid_simulation = FluidSimulation::new(simulation_params, scene_config, counters_enabled);

    // simulation starts paused
    fluid_simulation.pause();

    let progress_interval = max_steps.map(|n| (n / 10).max(1)).unwrap_or(100);

    loop {
        if max_steps.map_or(false, |n| fluid_simulation.step_number() >= n) {
            break;
        }
        if max_seconds.map_or(false, |s| fluid_simulation.time() >= s) {
            break;
        }

        let step = fluid_simulation.step_number() + 1;
        catch_unwind(AssertUnwindSafe(|| fluid_simulation.step())).map_err(|_| DriverError::Panicked { step })?;

        if let Some(particle) = fluid_simulation.first_non_finite_fluid_particle() {
            return Err(DriverError::Diverged { step, particle });
        }

        if step % progress_interval == 0 {
            info!("step {} (t={:.3}s)", step, fluid_simulation.time());
        }
    }

    info!(
        "finished {:?} scene after {} steps, simulated {:.3}s with {} fluid particles",
        fluid_simulation.scene_config().scene_type,
        fluid_simulation.step_number(),
        fluid_simulation.time(),
        fluid_simulation.num_fluid_particles()
    );

    Ok(fluid_simulation)
}

fn default_config(subcmd_matches: &ArgMatches) -> Result<(), DriverError> {
    let scene_type = match subcmd_matches.value_of("SCENE_TYPE") {
        Some(s) => parse_scene_type(s)?,
        None => SceneType::default(),
    };
    let fluid_size = match subcmd_matches.value_of("FLUID_SIZE") {
        Some(s) => parse_fluid_size(s)?,
        None => DEFAULT_FLUID_SIZE,
    };

    let simulation_params = SimulationParams::default();
    let scene_config = SceneConfig::centered(scene_type, fluid_size, simulation_params.particle_radius);
    scene_config.validate()?;

    let simulation_output = Path::new(subcmd_matches.value_of("SIMULATION_OUTPUT").unwrap_or_default());
    let scene_output = Path::new(subcmd_matches.value_of("SCENE_OUTPUT").unwrap_or_default());

    info!("Writing to file `{}`...", simulation_output.display());
    write_yaml(simulation_output, &simulation_params)?;
    info!("Writing to file `{}`...", scene_output.display());
    write_yaml(scene_output, &scene_config)?;

    Ok(())
}

#[test]
fn fluid_size_argument_needs_three_integers() {
    assert_eq!(parse_fluid_size("20,40,20").unwrap(), [20, 40, 20]);
    assert_eq!(parse_fluid_size(" 2, 3 ,4").unwrap(), [2, 3, 4]);
    assert!(parse_fluid_size("20,40").is_err());
    assert!(parse_fluid_size("a,b,c").is_err());
}

#[test]
fn scene_type_argument_is_case_insensitive() {
    assert_eq!(parse_scene_type("Spout").unwrap(), SceneType::Spout);
    assert_eq!(parse_scene_type("billow").unwrap(), SceneType::Billow);
    assert!(parse_scene_type("dam-break").is_err());
}

#[test]
fn driver_stops_after_max_steps_or_seconds() {
    let params = SimulationParams::default();
    let scene = SceneConfig::centered(SceneType::Block, [2, 2, 2], params.particle_radius);

    let sim = fluid_main(params, scene, Some(3), None, false).unwrap();
    assert_eq!(sim.step_number(), 3);

    let sim = fluid_main(params, scene, None, Some(2.5 * params.time_step), false).unwrap();
    assert_eq!(sim.step_number(), 3);
}
