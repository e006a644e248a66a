use crate::{
    floating_type_mod::{FT, PI},
    V3,
};

/// Distances at or below this value produce a zero spiky gradient.
pub const MIN_GRADIENT_DISTANCE: FT = 1.0e-6;

/**
 * Poly6 density kernel and spiky gradient for a fixed support radius `h`.
 *
 * The normalization factors are computed once in `new` and the value is never
 * mutated afterwards. A new support radius means a new `SphKernel`.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphKernel {
    h: FT,
    h2: FT,
    poly6_factor: FT,
    spiky_grad_factor: FT,
}

impl SphKernel {
    pub fn new(h: FT) -> SphKernel {
        SphKernel {
            h,
            h2: h * h,
            poly6_factor: 315. / (64. * PI * h.powi(9)),
            spiky_grad_factor: -45. / (PI * h.powi(6)),
        }
    }

    /**
     * W(r) = 315 / (64 PI h^9) * (h^2 - |r|^2)^3 for |r| < h.
     *
     * Only the squared distance is needed.
     */
    #[inline(always)]
    pub fn poly6(&self, r: V3) -> FT {
        let r2 = r.norm_squared();
        if r2 < self.h2 {
            let diff = self.h2 - r2;
            self.poly6_factor * diff * diff * diff
        } else {
            0.
        }
    }

    /**
     * Gradient of the spiky kernel: -45 / (PI h^6) * (h - |r|)^2 * r / |r|.
     *
     * Returns zero outside the support and for (nearly) coincident particles.
     */
    #[inline(always)]
    pub fn spiky_grad(&self, r: V3) -> V3 {
        let r_norm = r.norm();
        if r_norm > MIN_GRADIENT_DISTANCE && r_norm < self.h {
            let v = self.h - r_norm;
            r * (self.spiky_grad_factor * v * v / r_norm)
        } else {
            V3::zeros()
        }
    }
}

#[test]
fn poly6_value_at_center() {
    let h = 0.1;
    let kernel = SphKernel::new(h);
    let expected = 315. / (64. * PI * h * h * h);
    crate::assert_ft_approx_eq(kernel.poly6(V3::zeros()), expected, expected * 1e-5, || {
        format!("poly6(0) with h={}", h)
    });
}

#[test]
fn poly6_is_zero_outside_support() {
    let kernel = SphKernel::new(0.1);
    assert_eq!(kernel.poly6(crate::vec3f(0.1, 0., 0.)), 0.);
    assert_eq!(kernel.poly6(crate::vec3f(0.08, 0.08, 0.)), 0.);
    assert!(kernel.poly6(crate::vec3f(0.09, 0., 0.)) > 0.);
}

#[test]
fn poly6_integration_test() {
    let h = 0.1;
    let kernel = SphKernel::new(h);
    let grid_size = 60;
    let cube_len = 2. * h / grid_size as FT;
    let cube_volume = cube_len * cube_len * cube_len;

    let mut integral: f64 = 0.;

    for z in 0..grid_size {
        for y in 0..grid_size {
            for x in 0..grid_size {
                let integration_point = crate::vec3f(
                    (x as FT + 0.5) * cube_len - h,
                    (y as FT + 0.5) * cube_len - h,
                    (z as FT + 0.5) * cube_len - h,
                );
                integral += (kernel.poly6(integration_point) * cube_volume) as f64;
            }
        }
    }

    println!("Integration of poly6 kernel with h={:.2}: {}", h, integral);
    assert!((integral - 1.).abs() < 0.01);
}

#[test]
fn spiky_gradient_matches_finite_differences() {
    let h: FT = 0.1;
    let kernel = SphKernel::new(h);

    // spiky kernel value whose gradient is `spiky_grad`
    let spiky = |r: V3| {
        let r_norm = r.norm();
        if r_norm < h {
            15. / (PI * h.powi(6)) * (h - r_norm).powi(3)
        } else {
            0.
        }
    };

    let eps: FT = 1e-4;
    let probes = [
        crate::vec3f(0.02, 0.01, -0.03),
        crate::vec3f(-0.05, 0.04, 0.0),
        crate::vec3f(0.0, -0.07, 0.01),
        crate::vec3f(0.03, 0.03, 0.03),
    ];

    for probe in probes.iter() {
        let analytical = kernel.spiky_grad(*probe);
        for d in 0..3 {
            let mut offset = V3::zeros();
            offset[d] = eps;
            let approx = (spiky(probe + offset) - spiky(probe - offset)) / (2. * eps);
            let tolerance = analytical.norm() * 0.02 + 1.;
            crate::assert_ft_approx_eq(analytical[d], approx, tolerance, || {
                format!("spiky gradient component {} at {:?}", d, probe)
            });
        }
    }
}

#[test]
fn spiky_gradient_guards_coincident_and_distant_particles() {
    let kernel = SphKernel::new(0.1);
    assert_eq!(kernel.spiky_grad(V3::zeros()), V3::zeros());
    assert_eq!(kernel.spiky_grad(crate::vec3f(1e-7, 0., 0.)), V3::zeros());
    assert_eq!(kernel.spiky_grad(crate::vec3f(0., 0.1, 0.)), V3::zeros());

    // the gradient points towards the other particle (negative factor)
    let g = kernel.spiky_grad(crate::vec3f(0.05, 0., 0.));
    assert!(g.x < 0.);
    assert_eq!(g.y, 0.);
    assert_eq!(g.z, 0.);
}
