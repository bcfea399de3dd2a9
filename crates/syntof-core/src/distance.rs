//! Distance and kernel utilities.
//!
//! - [`squared_distances`]: squared Euclidean distances from points to centroids
//! - [`student_t_kernel`]: row-normalized Student's-t similarities (soft assignment)
//! - [`squared_distances_host`]: the same distances on host matrices, for k-means

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array2, ArrayView2, Axis};

use crate::EPSILON;

/// Squared Euclidean distances between rows of `points` [N, D] and `centroids` [K, D].
///
/// Uses the identity:
/// ```text
/// ||a - b||^2 = ||a||^2 + ||b||^2 - 2 * dot(a, b)
/// ```
///
/// # Returns
/// Distance matrix [N, K], clamped at zero.
pub fn squared_distances<B: Backend>(points: Tensor<B, 2>, centroids: Tensor<B, 2>) -> Tensor<B, 2> {
    // sum_dim(1) on [N, D] returns [N, 1] in Burn 0.19
    let point_norms = points.clone().powf_scalar(2.0).sum_dim(1); // [N, 1]
    let centroid_norms = centroids.clone().powf_scalar(2.0).sum_dim(1).transpose(); // [1, K]
    let dots = points.matmul(centroids.transpose()); // [N, K]

    // Clamp to avoid negative values from numerical error
    (point_norms + centroid_norms - dots.mul_scalar(2.0)).clamp_min(0.0)
}

/// Student's-t soft assignment.
///
/// ```text
/// q[i,j] = (1 + d2[i,j] / alpha)^(-(alpha + 1) / 2),  then rows sum to one
/// ```
pub fn student_t_kernel<B: Backend>(dist_sq: Tensor<B, 2>, alpha: f64) -> Tensor<B, 2> {
    let exponent = -(alpha + 1.0) / 2.0;
    let q = dist_sq.div_scalar(alpha).add_scalar(1.0).powf_scalar(exponent);
    let row_sum = q.clone().sum_dim(1).add_scalar(EPSILON); // [N, 1]
    q / row_sum
}

/// Squared Euclidean distances on the host, [N, D] x [K, D] -> [N, K].
pub fn squared_distances_host(points: ArrayView2<'_, f32>, centroids: ArrayView2<'_, f32>) -> Array2<f32> {
    let point_norms = points.map_axis(Axis(1), |row| row.dot(&row));
    let centroid_norms = centroids.map_axis(Axis(1), |row| row.dot(&row));
    let mut dots = points.dot(&centroids.t());
    for ((i, j), value) in dots.indexed_iter_mut() {
        *value = (point_norms[i] + centroid_norms[j] - 2.0 * *value).max(0.0);
    }
    dots
}

/// Index and squared distance of the closest centroid for one point.
pub fn nearest_centroid(point: ndarray::ArrayView1<'_, f32>, centroids: ArrayView2<'_, f32>) -> (usize, f32) {
    let mut best = (0usize, f32::INFINITY);
    for (j, centroid) in centroids.outer_iter().enumerate() {
        let d: f32 = point
            .iter()
            .zip(centroid.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if d < best.1 {
            best = (j, d);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{init_cpu_device, tensor_from_array, tensor_to_array, CpuBackend};
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_squared_distances_match_host() {
        let device = init_cpu_device();
        let points = array![[0.0f32, 0.0], [3.0, 4.0], [1.0, 1.0]];
        let centroids = array![[0.0f32, 0.0], [3.0, 0.0]];

        let on_device = squared_distances::<CpuBackend>(
            tensor_from_array(&points, &device),
            tensor_from_array(&centroids, &device),
        );
        let on_device = tensor_to_array(on_device).expect("download");
        let on_host = squared_distances_host(points.view(), centroids.view());

        assert_eq!(on_device.dim(), (3, 2));
        for (a, b) in on_device.iter().zip(on_host.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
        assert_relative_eq!(on_host[[1, 0]], 25.0, epsilon = 1e-5);
        assert_relative_eq!(on_host[[1, 1]], 16.0, epsilon = 1e-5);
    }

    #[test]
    fn test_student_t_rows_sum_to_one() {
        let device = init_cpu_device();
        let points = array![[0.0f32, 0.0], [10.0, 10.0], [5.0, 5.0]];
        let centroids = array![[0.0f32, 0.0], [10.0, 10.0]];
        let d2 = squared_distances::<CpuBackend>(
            tensor_from_array(&points, &device),
            tensor_from_array(&centroids, &device),
        );
        let q = tensor_to_array(student_t_kernel(d2, 1.0)).expect("download");

        for row in q.outer_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert!(q[[0, 0]] > 0.99);
        assert!(q[[1, 1]] > 0.99);
        assert_relative_eq!(q[[2, 0]], q[[2, 1]], epsilon = 1e-6);
    }

    #[test]
    fn test_nearest_centroid() {
        let centroids = array![[0.0f32, 0.0], [5.0, 5.0], [-5.0, 5.0]];
        let (idx, d) = nearest_centroid(array![4.0f32, 6.0].view(), centroids.view());
        assert_eq!(idx, 1);
        assert_relative_eq!(d, 2.0, epsilon = 1e-6);
    }
}
