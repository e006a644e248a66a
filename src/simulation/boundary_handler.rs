use log::warn;

use crate::{
    concurrency::par_iter_mut1,
    floating_type_mod::FT,
    neighborhood_search::{CellGrid, GridGeometry, NeighborhoodCache},
    particles::ParticleRanges,
    sph_kernels::SphKernel,
    V3,
};

/**
 * Static boundary particles (Akinci et al. 2012).
 *
 * Every boundary particle gets a pseudo-mass `psi_b = rest_density / sum_k W(x_b - x_k)`
 * where the sum runs over boundary particles only, so a fluid particle next to a
 * wall sees the wall with roughly the density of the fluid itself.
 */
pub struct ParticleBasedBoundaryHandler {
    // one entry per boundary particle, indexed by the offset inside the boundary range
    pub psi: Vec<FT>,

    // built once, boundary particles never move
    grid: CellGrid,
}

impl ParticleBasedBoundaryHandler {
    /// Bins the boundary particles, builds their boundary-only neighbor lists and
    /// computes the pseudo-masses.
    pub fn new(
        geometry: &GridGeometry,
        positions: &[V3],
        ranges: ParticleRanges,
        neighs: &mut NeighborhoodCache,
        kernel: &SphKernel,
        neighbor_distance_sq: FT,
        rest_density: FT,
    ) -> Self {
        let mut grid = CellGrid::new(geometry);
        grid.rebuild(geometry, positions, ranges.boundary());

        neighs.build_neighborhood_list_grid(geometry, positions, ranges.boundary(), &[&grid], neighbor_distance_sq);

        let mut handler = ParticleBasedBoundaryHandler {
            psi: vec![0.; ranges.num_boundary],
            grid,
        };
        handler.recompute_pseudo_masses(positions, ranges, neighs, kernel, rest_density);
        handler
    }

    fn recompute_pseudo_masses(
        &mut self,
        positions: &[V3],
        ranges: ParticleRanges,
        neighs: &NeighborhoodCache,
        kernel: &SphKernel,
        rest_density: FT,
    ) {
        par_iter_mut1(&mut self.psi, |b, psi| {
            let i = ranges.num_fluid + b;
            let xi = positions[i];

            let mut number_density: FT = 0.;
            for j in neighs.iter(i) {
                number_density += kernel.poly6(xi - positions[j]);
            }

            // not guarded: an empty neighborhood gives an infinite pseudo-mass
            *psi = rest_density / number_density;
        });

        let num_non_finite = self.psi.iter().filter(|psi| !psi.is_finite()).count();
        if num_non_finite > 0 {
            warn!(
                "{} of {} boundary particles have a non-finite pseudo-mass (no boundary neighbors inside the grid)",
                num_non_finite,
                self.psi.len()
            );
        }
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn psi(&self) -> &[FT] {
        &self.psi
    }

    pub fn num_boundary_particles(&self) -> usize {
        self.psi.len()
    }
}

#[cfg(test)]
fn boundary_setup(positions: &[V3], num_fluid: usize) -> (ParticleBasedBoundaryHandler, NeighborhoodCache) {
    let kernel = SphKernel::new(0.1);
    let geometry = GridGeometry::new(0.1, V3::repeat(-0.5), V3::repeat(0.5));
    let ranges = ParticleRanges::new(num_fluid, positions.len() - num_fluid);
    let mut neighs = NeighborhoodCache::new(positions.len());
    let handler = ParticleBasedBoundaryHandler::new(&geometry, positions, ranges, &mut neighs, &kernel, 0.01, 1000.);
    (handler, neighs)
}

#[test]
fn single_boundary_particle_pseudo_mass() {
    // fluid particle right next to it must not contribute
    let positions = vec![crate::vec3f(0.01, 0., 0.), crate::vec3f(0., 0., 0.)];
    let (handler, neighs) = boundary_setup(&positions, 1);

    assert_eq!(neighs.iter(1).collect::<Vec<_>>(), vec![1]);
    assert_eq!(neighs.neighbor_count(0), 0);

    let expected = 1000. / SphKernel::new(0.1).poly6(V3::zeros());
    crate::assert_ft_approx_eq(handler.psi[0], expected, expected * 1e-5, || "psi".to_string());
}

#[test]
fn denser_walls_get_lighter_particles() {
    let mut sparse = Vec::new();
    let mut dense = Vec::new();
    for i in -3..=3 {
        for k in -3..=3 {
            sparse.push(crate::vec3f(i as FT * 0.08, 0., k as FT * 0.08));
            dense.push(crate::vec3f(i as FT * 0.04, 0., k as FT * 0.04));
        }
    }
    let (sparse_handler, _) = boundary_setup(&sparse, 0);
    let (dense_handler, _) = boundary_setup(&dense, 0);

    // center particle
    let center = 24;
    assert!(dense_handler.psi[center] < sparse_handler.psi[center]);
    assert!(dense_handler.psi.iter().all(|psi| psi.is_finite() && *psi > 0.));
    assert_eq!(dense_handler.num_boundary_particles(), 49);
    assert_eq!(dense_handler.grid().num_binned(), 49);
}

#[test]
fn boundary_particle_outside_grid_has_infinite_pseudo_mass() {
    let positions = vec![crate::vec3f(0., 0., 0.), crate::vec3f(100., 0., 0.)];
    let (handler, _) = boundary_setup(&positions, 0);
    assert!(handler.psi[0].is_finite());
    assert!(handler.psi[1].is_infinite());
}
