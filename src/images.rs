use crate::workload::Workload;
use kube::ResourceExt;

pub const IGNORE_ANNOTATION: &str = "kube-image-prefetch/ignore";
pub const IGNORE_CONTAINERS_ANNOTATION: &str = "kube-image-prefetch/ignore-containers";

/// Returns the images a workload needs, init containers first, in manifest order.
///
/// Containers named in the ignore-containers annotation are skipped and a
/// workload annotated with `ignore: "true"` yields nothing. Duplicates are kept.
pub fn get_images<W: Workload>(workload: &W) -> Vec<String> {
    let annotations = workload.annotations();

    if annotations.get(IGNORE_ANNOTATION).map(String::as_str) == Some("true") {
        return Vec::new();
    }

    let ignored: Vec<String> = annotations
        .get(IGNORE_CONTAINERS_ANNOTATION)
        .map(|value| value.split(',').map(normalize).collect())
        .unwrap_or_default();

    let Some(pod_spec) = workload.pod_spec() else {
        return Vec::new();
    };

    pod_spec
        .init_containers
        .iter()
        .flatten()
        .chain(pod_spec.containers.iter())
        .filter(|container| !ignored.contains(&normalize(&container.name)))
        .filter_map(|container| container.image.clone())
        .collect()
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
