/*!
Position Based Fluids solver with static particle boundaries.

The solver core lives in `simulation`; `platform` holds the command line
driver used by the `pbf-fluids` binary.
*/

pub mod platform;
pub mod simulation;

pub use simulation::*;
