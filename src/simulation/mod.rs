pub mod boundary_handler;
pub mod concurrency;
pub mod neighborhood_search;
pub mod particles;
pub mod scene;
pub mod simulation_parameters;
pub mod sph_kernels;
pub mod statistics;
pub mod simulation;

pub type IT = i32;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::PI;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::PI;
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

pub type V3 = V<FT, 3>;
pub type VI3 = V<IT, 3>;

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub fn vec3i(x: IT, y: IT, z: IT) -> VI3 {
    [x, y, z].into()
}

pub use simulation::*;
