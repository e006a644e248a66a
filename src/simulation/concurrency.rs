//! Data-parallel loops over particle attributes.
//!
//! Every helper returns only after the closure ran for every index, so two
//! consecutive calls are separated by a full barrier. Closures write only to
//! the element(s) handed to them and read everything else through shared
//! borrows.

pub use internal::*;

#[cfg(target_arch = "wasm32")]
mod internal {
    pub fn into_par_iter<T>(
        v: impl IntoIterator<Item = T, IntoIter = impl Iterator<Item = T>>,
    ) -> impl Iterator<Item = T> {
        v.into_iter()
    }

    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.into_iter().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.into_iter()
            .zip(arr2.into_iter())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod internal {
    use rayon::prelude::*;

    pub fn into_par_iter<T>(v: impl IntoParallelIterator<Item = T>) -> impl ParallelIterator<Item = T> {
        v.into_par_iter()
    }

    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.into_par_iter()
            .zip(arr2.into_par_iter())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}

#[test]
fn par_iter_mut2_visits_every_index_once() {
    let mut a = vec![0usize; 1000];
    let mut b = vec![0usize; 1000];
    par_iter_mut2(&mut a, &mut b, |i, a, b| {
        *a += i;
        *b += 1;
    });
    assert!(a.iter().enumerate().all(|(i, &v)| v == i));
    assert!(b.iter().all(|&v| v == 1));
}
