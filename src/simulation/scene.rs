use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::{
    floating_type_mod::FT, particles::ParticleRanges, simulation_parameters::SceneConfig, vec3f, IT, V3, VI3,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SceneType {
    // one block of fluid resting in a corner of the container
    Block,
    // the block plus a flat, deep layer of fluid behind it
    Billow,
    // a shallow pool with a column of fluid placed above it
    Spout,
}

impl Default for SceneType {
    fn default() -> Self {
        SceneType::Block
    }
}

/// Geometry shared by all layouts of one scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutContext {
    pub particle_radius: FT,
    pub particle_diameter: FT,
    pub fluid_size: VI3,
    // center of the first fluid particle
    pub fluid_origin: V3,
    pub container_size: VI3,
    pub container_corner: V3,
}

impl LayoutContext {
    pub fn new(scene_config: &SceneConfig, particle_radius: FT) -> LayoutContext {
        let particle_diameter = 2. * particle_radius;
        let container_corner = scene_config.container_corner_position();

        let fluid_origin = (container_corner.add_scalar(particle_diameter) + scene_config.fluid_corner_position())
            .add_scalar(particle_radius);

        LayoutContext {
            particle_radius,
            particle_diameter,
            fluid_size: scene_config.fluid_size(),
            fluid_origin,
            container_size: scene_config.container_size(),
            container_corner,
        }
    }

    #[inline]
    fn lattice_position(&self, i: IT, j: IT, k: IT) -> V3 {
        self.fluid_origin + vec3f(i as FT, j as FT, k as FT) * self.particle_diameter
    }

    /// Inclusive box for fluid particle centers.
    pub fn position_bounds(&self) -> (V3, V3) {
        let position_min = self.container_corner.add_scalar(self.particle_diameter);
        let position_max = position_min + self.container_size.map(|x| x as FT) * self.particle_diameter;
        (position_min, position_max)
    }

    /// Extent of the container including its boundary layer.
    pub fn domain(&self) -> (V3, V3) {
        let outer_size = self.container_size.map(|x| (x + 2) as FT);
        (
            self.container_corner,
            self.container_corner + outer_size * self.particle_diameter,
        )
    }

    fn fluid_size_f(&self) -> V3 {
        self.fluid_size.map(|x| x as FT)
    }
}

/// `start, start + 1, ...` for as long as `(i as FT) < bound`.
fn lattice_range(start: IT, bound: FT) -> impl Iterator<Item = IT> {
    (start..).take_while(move |&i| (i as FT) < bound)
}

#[enum_dispatch]
pub trait FluidLayout {
    fn add_fluid_particles(&self, ctx: &LayoutContext, positions: &mut Vec<V3>);
}

#[derive(Debug, Clone, Copy)]
pub struct BlockLayout;

#[derive(Debug, Clone, Copy)]
pub struct BillowLayout;

#[derive(Debug, Clone, Copy)]
pub struct SpoutLayout;

fn add_fluid_block(ctx: &LayoutContext, positions: &mut Vec<V3>) {
    let size = ctx.fluid_size;
    for i in 0..size.x {
        for j in 0..size.y {
            for k in 0..size.z {
                positions.push(ctx.lattice_position(i, j, k));
            }
        }
    }
}

impl FluidLayout for BlockLayout {
    fn add_fluid_particles(&self, ctx: &LayoutContext, positions: &mut Vec<V3>) {
        add_fluid_block(ctx, positions);
    }
}

impl FluidLayout for BillowLayout {
    fn add_fluid_particles(&self, ctx: &LayoutContext, positions: &mut Vec<V3>) {
        add_fluid_block(ctx, positions);

        let size = ctx.fluid_size_f();
        for i in lattice_range(0, 2. * size.x) {
            for j in lattice_range(0, 0.4 * size.y) {
                for k in lattice_range(ctx.fluid_size.z, 1.5 * size.z) {
                    positions.push(ctx.lattice_position(i, j, k));
                }
            }
        }
    }
}

impl FluidLayout for SpoutLayout {
    fn add_fluid_particles(&self, ctx: &LayoutContext, positions: &mut Vec<V3>) {
        let size = ctx.fluid_size_f();

        // pool
        for i in lattice_range(0, 3. * size.x) {
            for j in lattice_range(0, 0.2 * size.y) {
                for k in lattice_range(0, 2. * size.z) {
                    positions.push(ctx.lattice_position(i, j, k));
                }
            }
        }

        // column, mirrored to the far side of the container in x
        let far_x = ctx.container_corner.x + ctx.container_size.x as FT * ctx.particle_diameter + ctx.particle_radius;
        for i in lattice_range((1.3 * size.x) as IT, 1.7 * size.x) {
            for j in lattice_range((0.4 * size.y) as IT, 2.4 * size.y) {
                for k in lattice_range((0.8 * size.z) as IT, 1.2 * size.z) {
                    let mut position = ctx.lattice_position(i, j, k);
                    position.x = far_x - i as FT * ctx.particle_diameter;
                    positions.push(position);
                }
            }
        }
    }
}

#[enum_dispatch(FluidLayout)]
#[derive(Debug, Clone, Copy)]
pub enum SceneLayout {
    BlockLayout(BlockLayout),
    BillowLayout(BillowLayout),
    SpoutLayout(SpoutLayout),
}

impl From<SceneType> for SceneLayout {
    fn from(scene_type: SceneType) -> Self {
        match scene_type {
            SceneType::Block => BlockLayout.into(),
            SceneType::Billow => BillowLayout.into(),
            SceneType::Spout => SpoutLayout.into(),
        }
    }
}

/**
 * One layer of boundary particles around the container, one particle
 * diameter apart. Opposite faces are emitted interleaved.
 */
pub fn add_boundary_box(ctx: &LayoutContext, positions: &mut Vec<V3>) {
    let base = ctx.container_corner.add_scalar(ctx.particle_radius);
    let d = ctx.particle_diameter;
    let c = ctx.container_size;
    let at = |i: IT, j: IT, k: IT| base + vec3f(i as FT, j as FT, k as FT) * d;

    // back and front
    for i in 0..c.x + 2 {
        for j in 0..c.y + 2 {
            positions.push(at(i, j, 0));
            positions.push(at(i, j, c.z + 1));
        }
    }

    // left and right
    for j in 0..c.y + 2 {
        for k in 1..=c.z {
            positions.push(at(0, j, k));
            positions.push(at(c.x + 1, j, k));
        }
    }

    // bottom and top
    for i in 1..=c.x {
        for k in 1..=c.z {
            positions.push(at(i, 0, k));
            positions.push(at(i, c.y + 1, k));
        }
    }
}

/// Initial particle set of a scene: fluid particles first, then the boundary.
pub struct ParticleLayout {
    pub positions: Vec<V3>,
    pub ranges: ParticleRanges,
    pub position_min: V3,
    pub position_max: V3,
    pub domain_min: V3,
    pub domain_max: V3,
}

pub fn create_particles(scene_config: &SceneConfig, particle_radius: FT) -> ParticleLayout {
    let ctx = LayoutContext::new(scene_config, particle_radius);
    let layout = SceneLayout::from(scene_config.scene_type);

    let mut positions = Vec::new();
    layout.add_fluid_particles(&ctx, &mut positions);
    let num_fluid = positions.len();

    add_boundary_box(&ctx, &mut positions);
    let num_boundary = positions.len() - num_fluid;

    let (position_min, position_max) = ctx.position_bounds();
    let (domain_min, domain_max) = ctx.domain();

    ParticleLayout {
        positions,
        ranges: ParticleRanges::new(num_fluid, num_boundary),
        position_min,
        position_max,
        domain_min,
        domain_max,
    }
}

#[cfg(test)]
fn boundary_count(c: [IT; 3]) -> usize {
    let [x, y, z] = c;
    (2 * (x + 2) * (y + 2) + 2 * (y + 2) * z + 2 * x * z) as usize
}

#[test]
fn block_layout_particle_counts() {
    let scene = SceneConfig::centered(SceneType::Block, [2, 2, 2], 0.03345);
    let layout = create_particles(&scene, 0.03345);
    assert_eq!(layout.ranges.num_fluid, 8);
    assert_eq!(layout.ranges.num_boundary, boundary_count(scene.container_size));
    assert_eq!(layout.ranges.num_boundary, 184);
    assert_eq!(layout.positions.len(), layout.ranges.num_particles());
}

#[test]
fn billow_and_spout_particle_counts() {
    let billow = SceneConfig::centered(SceneType::Billow, [4, 4, 4], 0.03345);
    assert_eq!(create_particles(&billow, 0.03345).ranges.num_fluid, 64 + 8 * 2 * 2);

    // pool 12 * 1 * 8, column 2 * 9 * 2
    let spout = SceneConfig::centered(SceneType::Spout, [4, 4, 4], 0.03345);
    assert_eq!(create_particles(&spout, 0.03345).ranges.num_fluid, 96 + 36);
}

#[test]
fn fluid_particles_start_inside_clamp_bounds() {
    for scene_type in [SceneType::Block, SceneType::Billow, SceneType::Spout].iter() {
        let scene = SceneConfig::centered(*scene_type, [4, 4, 4], 0.03345);
        let layout = create_particles(&scene, 0.03345);
        for p in &layout.positions[layout.ranges.fluid()] {
            for d in 0..3 {
                assert!(
                    p[d] >= layout.position_min[d] && p[d] <= layout.position_max[d],
                    "{:?}: fluid particle {:?} outside of [{:?}, {:?}]",
                    scene_type,
                    p,
                    layout.position_min,
                    layout.position_max
                );
            }
        }
    }
}

#[test]
fn boundary_particles_enclose_the_container() {
    let scene = SceneConfig::centered(SceneType::Block, [3, 3, 3], 0.05);
    let layout = create_particles(&scene, 0.05);
    let boundary = &layout.positions[layout.ranges.boundary()];

    // first particle sits in the container corner, offset by one radius
    let expected_first = scene.container_corner_position().add_scalar(0.05);
    assert!((boundary[0] - expected_first).norm() < 1e-6);

    for p in boundary {
        for d in 0..3 {
            assert!(p[d] > layout.domain_min[d] && p[d] < layout.domain_max[d]);
        }
        let on_wall = (0..3).any(|d| {
            (p[d] - (layout.position_min[d] - 0.05)).abs() < 1e-5
                || (p[d] - (layout.position_max[d] + 0.05)).abs() < 1e-5
        });
        assert!(on_wall, "boundary particle {:?} is not on a container wall", p);
    }

    // no duplicates on edges or corners
    for a in 0..boundary.len() {
        for b in (a + 1)..boundary.len() {
            assert!((boundary[a] - boundary[b]).norm() > 0.05);
        }
    }
}
