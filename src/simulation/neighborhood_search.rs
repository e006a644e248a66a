use std::ops::Range;

use crate::{concurrency::par_iter_mut1, floating_type_mod::FT, V, V3, VI3};

/// Calls `f` for the 27 cell offsets of the 3x3x3 stencil, x-major.
pub fn iterate_grid_neighbors(dist: i32, mut f: impl FnMut(VI3)) {
    for x in -dist..=dist {
        for y in -dist..=dist {
            for z in -dist..=dist {
                f([x, y, z].into());
            }
        }
    }
}

/**
 * Cell layout shared by the fluid and the boundary grid.
 *
 * Absolute cell indices are `floor(p / cell_size)`. Only cells inside
 * `[cell_min, cell_max]` (inclusive) exist; particles outside are not binned.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    inv_cell_size: FT,
    cell_min: VI3,
    cell_max: VI3,
    size: V<usize, 3>,
}

impl GridGeometry {
    /// `domain_min`/`domain_max` are padded by one cell on each side.
    pub fn new(cell_size: FT, domain_min: V3, domain_max: V3) -> GridGeometry {
        let inv_cell_size = 1. / cell_size;
        let cell_min = (domain_min * inv_cell_size).map(|x| x.floor() as i32 - 1);
        let cell_max = (domain_max * inv_cell_size).map(|x| x.floor() as i32 + 1);
        let size = (cell_max - cell_min).map(|x| (x + 1).max(0) as usize);

        GridGeometry {
            inv_cell_size,
            cell_min,
            cell_max,
            size,
        }
    }

    pub fn size(&self) -> V<usize, 3> {
        self.size
    }

    pub fn num_cells(&self) -> usize {
        self.size.fold(1, |acc, x| acc * x)
    }

    #[inline(always)]
    pub fn cell_of(&self, p: V3) -> VI3 {
        (p * self.inv_cell_size).map(|x| x.floor() as i32)
    }

    #[inline(always)]
    pub fn contains(&self, cell: VI3) -> bool {
        (0..3).all(|d| cell[d] >= self.cell_min[d] && cell[d] <= self.cell_max[d])
    }

    /// Row-major linear index (x slowest, z fastest) or `None` outside the grid.
    #[inline(always)]
    pub fn linear_index(&self, cell: VI3) -> Option<usize> {
        if !self.contains(cell) {
            return None;
        }
        let rel = (cell - self.cell_min).map(|x| x as usize);
        Some(rel.x * self.size.y * self.size.z + rel.y * self.size.z + rel.z)
    }
}

/**
 * Particle ids bucketed by cell, stored as one sorted array plus a start
 * offset per cell (counting sort). The particles of cell `c` are
 * `particle_ids[cell_start[c]..cell_start[c + 1]]` in ascending order.
 */
#[derive(Debug, Clone)]
pub struct CellGrid {
    cell_start: Vec<u32>,
    particle_ids: Vec<u32>,

    // scratch: linear cell index of every particle in the last rebuilt range
    particle_cells: Vec<Option<usize>>,
    cell_cursor: Vec<u32>,
}

impl CellGrid {
    pub fn new(geometry: &GridGeometry) -> CellGrid {
        CellGrid {
            cell_start: vec![0; geometry.num_cells() + 1],
            particle_ids: Vec::new(),
            particle_cells: Vec::new(),
            cell_cursor: Vec::new(),
        }
    }

    /// Rebins the particles `range` of `positions`. Particles outside the grid are skipped.
    pub fn rebuild(&mut self, geometry: &GridGeometry, positions: &[V3], range: Range<usize>) {
        let num_cells = geometry.num_cells();
        let first = range.start;

        self.particle_cells.clear();
        self.particle_cells.resize(range.len(), None);
        par_iter_mut1(&mut self.particle_cells, |k, p_cell| {
            *p_cell = geometry.linear_index(geometry.cell_of(positions[first + k]));
        });

        self.cell_start.clear();
        self.cell_start.resize(num_cells + 1, 0);
        for cell in self.particle_cells.iter().flatten() {
            self.cell_start[cell + 1] += 1;
        }
        for c in 0..num_cells {
            self.cell_start[c + 1] += self.cell_start[c];
        }

        self.cell_cursor.clear();
        self.cell_cursor.extend_from_slice(&self.cell_start[..num_cells]);
        self.particle_ids.clear();
        self.particle_ids.resize(self.cell_start[num_cells] as usize, 0);
        for (k, cell) in self.particle_cells.iter().enumerate() {
            if let Some(cell) = *cell {
                let slot = &mut self.cell_cursor[cell];
                self.particle_ids[*slot as usize] = (first + k) as u32;
                *slot += 1;
            }
        }
    }

    #[inline(always)]
    pub fn cell(&self, linear_index: usize) -> &[u32] {
        let start = self.cell_start[linear_index] as usize;
        let end = self.cell_start[linear_index + 1] as usize;
        &self.particle_ids[start..end]
    }

    /// Number of particles binned by the last rebuild.
    pub fn num_binned(&self) -> usize {
        self.particle_ids.len()
    }
}

/**
 * This lists stores for each particle the particle indices of its neighbors.
 * A particle is always its own neighbor as long as it is inside the grid.
 */
pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = usize> + 'a {
        self.neighs[i].iter().map(|&x| x as usize)
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }

    /**
     * Recomputes the lists of the particles in `source_range`.
     *
     * Candidates come from the 27 cells around the source cell, taken from
     * every grid in `grids` (in that order), and are accepted if their
     * squared distance is below `neighbor_distance_sq`.
     */
    pub fn build_neighborhood_list_grid(
        &mut self,
        geometry: &GridGeometry,
        positions: &[V3],
        source_range: Range<usize>,
        grids: &[&CellGrid],
        neighbor_distance_sq: FT,
    ) {
        let first = source_range.start;

        par_iter_mut1(&mut self.neighs[source_range], |k, p_neighs| {
            p_neighs.clear();

            let i = first + k;
            let xi = positions[i];
            let source_cell = geometry.cell_of(xi);

            iterate_grid_neighbors(1, |offset| {
                let target_cell = source_cell.zip_map(&offset, |c, o| c.saturating_add(o));
                let target_cell = match geometry.linear_index(target_cell) {
                    Some(target_cell) => target_cell,
                    None => return,
                };

                for grid in grids {
                    for &j in grid.cell(target_cell) {
                        if (xi - positions[j as usize]).norm_squared() < neighbor_distance_sq {
                            p_neighs.push(j);
                        }
                    }
                }
            });
        });
    }
}

#[cfg(test)]
fn random_positions(n: usize, seed: u64, min: FT, max: FT) -> Vec<V3> {
    // xorshift, good enough to scatter test particles
    let mut state = seed.max(1);
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % 1_000_000) as FT / 1_000_000.
    };
    (0..n)
        .map(|_| crate::vec3f(next(), next(), next()) * (max - min) + V3::repeat(min))
        .collect()
}

#[test]
fn grid_bins_every_particle_in_domain_exactly_once() {
    let geometry = GridGeometry::new(0.1, V3::repeat(-0.5), V3::repeat(0.5));
    let positions = random_positions(500, 42, -0.5, 0.5);
    let mut grid = CellGrid::new(&geometry);
    grid.rebuild(&geometry, &positions, 0..positions.len());

    assert_eq!(grid.num_binned(), positions.len());

    let mut seen = vec![0; positions.len()];
    for c in 0..geometry.num_cells() {
        let ids = grid.cell(c);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "cell ids must be ascending");
        for &id in ids {
            seen[id as usize] += 1;
            let cell = geometry.cell_of(positions[id as usize]);
            assert_eq!(geometry.linear_index(cell), Some(c));
        }
    }
    assert!(seen.iter().all(|&n| n == 1));
}

#[test]
fn grid_drops_particles_outside_domain() {
    let geometry = GridGeometry::new(0.1, V3::repeat(0.), V3::repeat(0.3));
    let positions = vec![
        crate::vec3f(0.05, 0.05, 0.05),
        crate::vec3f(10., 0.05, 0.05),
        crate::vec3f(0.05, -3., 0.05),
        crate::vec3f(0.25, 0.25, 0.25),
    ];
    let mut grid = CellGrid::new(&geometry);
    grid.rebuild(&geometry, &positions, 0..positions.len());
    assert_eq!(grid.num_binned(), 2);

    // only a sub range is binned, with global ids
    grid.rebuild(&geometry, &positions, 2..4);
    assert_eq!(grid.num_binned(), 1);
    let c = geometry.linear_index(geometry.cell_of(positions[3])).unwrap();
    assert_eq!(grid.cell(c), &[3]);
}

#[test]
fn grid_neighbor_search_matches_brute_force() {
    let neighbor_distance: FT = 0.12;
    let geometry = GridGeometry::new(neighbor_distance, V3::repeat(-0.4), V3::repeat(0.4));
    let positions = random_positions(400, 7, -0.4, 0.4);
    let split = 250;

    let mut grid_a = CellGrid::new(&geometry);
    let mut grid_b = CellGrid::new(&geometry);
    grid_a.rebuild(&geometry, &positions, 0..split);
    grid_b.rebuild(&geometry, &positions, split..positions.len());

    let mut neighs = NeighborhoodCache::new(positions.len());
    neighs.build_neighborhood_list_grid(
        &geometry,
        &positions,
        0..split,
        &[&grid_a, &grid_b],
        neighbor_distance * neighbor_distance,
    );

    for i in 0..split {
        let mut found: Vec<usize> = neighs.iter(i).collect();
        found.sort_unstable();
        let expected: Vec<usize> = (0..positions.len())
            .filter(|&j| (positions[i] - positions[j]).norm_squared() < neighbor_distance * neighbor_distance)
            .collect();
        assert_eq!(found, expected, "neighbors of particle {}", i);
        assert!(found.contains(&i), "particle must be its own neighbor");
    }

    // lists outside of the source range stay untouched
    for i in split..positions.len() {
        assert_eq!(neighs.neighbor_count(i), 0);
    }
}

#[test]
fn neighbor_search_only_sees_supplied_grids() {
    let geometry = GridGeometry::new(0.1, V3::repeat(0.), V3::repeat(0.5));
    let positions = vec![crate::vec3f(0.2, 0.2, 0.2), crate::vec3f(0.21, 0.2, 0.2)];

    let mut fluid_grid = CellGrid::new(&geometry);
    let mut boundary_grid = CellGrid::new(&geometry);
    fluid_grid.rebuild(&geometry, &positions, 0..1);
    boundary_grid.rebuild(&geometry, &positions, 1..2);

    let mut neighs = NeighborhoodCache::new(2);
    neighs.build_neighborhood_list_grid(&geometry, &positions, 1..2, &[&boundary_grid], 0.01);
    assert_eq!(neighs.iter(1).collect::<Vec<_>>(), vec![1]);

    neighs.build_neighborhood_list_grid(&geometry, &positions, 0..1, &[&fluid_grid, &boundary_grid], 0.01);
    assert_eq!(neighs.iter(0).collect::<Vec<_>>(), vec![0, 1]);
}
