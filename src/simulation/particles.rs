use std::ops::Range;

use nalgebra::zero;

use crate::{floating_type_mod::FT, V3};

/**
 * A particle index resolved into its kind.
 *
 * All particles share one contiguous index space: fluid particles first, then
 * boundary particles. The payload is the offset inside the kind's own range,
 * so `Boundary(b)` can index `psi[b]` directly.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleId {
    Fluid(usize),
    Boundary(usize),
}

/// Sizes of the fluid and boundary ranges. Fixed between two resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticleRanges {
    pub num_fluid: usize,
    pub num_boundary: usize,
}

impl ParticleRanges {
    pub fn new(num_fluid: usize, num_boundary: usize) -> Self {
        ParticleRanges {
            num_fluid,
            num_boundary,
        }
    }

    pub fn num_particles(&self) -> usize {
        self.num_fluid + self.num_boundary
    }

    pub fn fluid(&self) -> Range<usize> {
        0..self.num_fluid
    }

    pub fn boundary(&self) -> Range<usize> {
        self.num_fluid..self.num_particles()
    }

    #[inline(always)]
    pub fn classify(&self, j: usize) -> ParticleId {
        if j < self.num_fluid {
            ParticleId::Fluid(j)
        } else {
            ParticleId::Boundary(j - self.num_fluid)
        }
    }
}

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct FluidParticleVec {
        // positions after the last velocity update
        pub last_position: Vec<V3> | zero(),
        pub velocity: Vec<V3> | zero(),

        pub density: Vec<FT> | 0.,
        pub lambda: Vec<FT> | 0.,

        // scratch buffers, overwritten by every phase that uses them
        pub delta_position: Vec<V3> | zero(),
        pub delta_velocity: Vec<V3> | zero(),
    }
}

#[test]
fn classify_splits_at_fluid_count() {
    let ranges = ParticleRanges::new(3, 2);
    assert_eq!(ranges.num_particles(), 5);
    assert_eq!(ranges.classify(0), ParticleId::Fluid(0));
    assert_eq!(ranges.classify(2), ParticleId::Fluid(2));
    assert_eq!(ranges.classify(3), ParticleId::Boundary(0));
    assert_eq!(ranges.classify(4), ParticleId::Boundary(1));
    assert_eq!(ranges.fluid(), 0..3);
    assert_eq!(ranges.boundary(), 3..5);
}
