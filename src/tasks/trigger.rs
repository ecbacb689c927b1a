//! When finished work should schedule clustering.

/// An incremental clustering pass is worth running once enough embedded faces
/// are waiting for a person.
pub fn should_cluster(unassigned_embedded_faces: i64, min_unassigned: usize) -> bool {
    unassigned_embedded_faces > 0 && unassigned_embedded_faces as u64 >= min_unassigned as u64
}

/// A full recluster is due each time the person count crosses a multiple of
/// `every`. A batch that creates several persons at once still triggers once.
pub fn should_recluster(persons_before: i64, created: usize, every: usize) -> bool {
    if every == 0 || created == 0 {
        return false;
    }
    let every = every as i64;
    let before = persons_before.max(0);
    let after = before + created as i64;
    before / every < after / every
}
