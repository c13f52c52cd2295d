use crate::{
    error::{TerrainError, TerrainResult},
    patch::{generate_base_patch, PatchEdge, SideSeams, StitchedEdges, TerrainPatch},
};
use bevy::math::Vec2;
use itertools::Itertools;

fn with_midpoints(row: &[Vec2]) -> Vec<Vec2> {
    let mut stitched = Vec::with_capacity(2 * row.len() - 1);

    for (&a, &b) in row.iter().tuple_windows() {
        stitched.push(a);
        stitched.push((a + b) * 0.5);
    }
    stitched.extend(row.last());

    stitched
}

/// Inserts the vertices of the next finer level of detail along one edge of the patch.
///
/// Every edge can be stitched only once. Stitching the left and the right edge yields the same
/// vertices regardless of the order.
pub fn stitch_patch_edge(patch: &mut TerrainPatch, edge: PatchEdge) -> TerrainResult<()> {
    if patch.stitched.contains(edge.into()) {
        return Err(TerrainError::EdgeAlreadyStitched(edge));
    }

    insert_edge_vertices(patch, edge);

    Ok(())
}

fn insert_edge_vertices(patch: &mut TerrainPatch, edge: PatchEdge) {
    let size = patch.size as f32;

    match edge {
        PatchEdge::Left | PatchEdge::Right => {
            let x = if edge == PatchEdge::Left { 0.0 } else { size };

            match patch.side_seams {
                SideSeams::None => {
                    let rows = std::mem::take(&mut patch.rows);
                    let mut seamed = Vec::with_capacity(2 * rows.len() - 1);

                    for (above, below) in rows.iter().tuple_windows() {
                        let z = (above[0].y + below[0].y) * 0.5;
                        seamed.push(above.clone());
                        seamed.push(vec![Vec2::new(x, z)]);
                    }
                    seamed.extend(rows.last().cloned());

                    patch.rows = seamed;
                    patch.side_seams = SideSeams::RowsInserted;
                }
                SideSeams::RowsInserted => {
                    for seam in patch.rows.iter_mut().skip(1).step_by(2) {
                        let vertex = Vec2::new(x, seam[0].y);

                        if edge == PatchEdge::Left {
                            seam.insert(0, vertex);
                        } else {
                            seam.push(vertex);
                        }
                    }
                }
            }
        }
        PatchEdge::Top => {
            patch.rows[0] = with_midpoints(&patch.rows[0]);
        }
        PatchEdge::Bottom => {
            if let Some(last) = patch.rows.last_mut() {
                *last = with_midpoints(last);
            }
        }
    }

    patch.stitched |= edge.into();
}

impl TerrainPatch {
    /// Builds a patch with every edge in `edges` stitched.
    ///
    /// Since an edge set can not contain an edge twice, this can not fail.
    pub fn with_stitched_edges(size: u32, lod: u32, edges: StitchedEdges) -> Self {
        let mut patch = generate_base_patch(size, lod);

        for edge in edges.edges() {
            insert_edge_vertices(&mut patch, edge);
        }

        patch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchEdge::*;

    #[test]
    fn restitching_is_rejected() {
        for edge in PatchEdge::ALL {
            let mut patch = generate_base_patch(8, 0);
            stitch_patch_edge(&mut patch, edge).unwrap();
            let vertex_count = patch.vertex_count();

            assert_eq!(
                stitch_patch_edge(&mut patch, edge),
                Err(TerrainError::EdgeAlreadyStitched(edge))
            );
            assert_eq!(patch.vertex_count(), vertex_count);
        }
    }

    #[test]
    fn side_order_does_not_matter() {
        for (size, lod) in [(8, 0), (16, 1), (17, 2), (256, 2)] {
            let mut left_first = generate_base_patch(size, lod);
            stitch_patch_edge(&mut left_first, Left).unwrap();
            stitch_patch_edge(&mut left_first, Right).unwrap();

            let mut right_first = generate_base_patch(size, lod);
            stitch_patch_edge(&mut right_first, Right).unwrap();
            stitch_patch_edge(&mut right_first, Left).unwrap();

            assert_eq!(left_first.vertex_count(), right_first.vertex_count());
            assert_eq!(left_first.rows, right_first.rows);
        }
    }

    #[test]
    fn left_seam_rows_sit_at_midpoints() {
        let mut patch = generate_base_patch(4, 1);
        stitch_patch_edge(&mut patch, Left).unwrap();

        assert_eq!(patch.side_seams, SideSeams::RowsInserted);
        assert_eq!(patch.rows.len(), 5);
        assert_eq!(patch.rows[1], vec![Vec2::new(0.0, 1.0)]);
        assert_eq!(patch.rows[3], vec![Vec2::new(0.0, 3.0)]);

        stitch_patch_edge(&mut patch, Right).unwrap();

        assert_eq!(patch.rows[1], vec![Vec2::new(0.0, 1.0), Vec2::new(4.0, 1.0)]);
    }

    #[test]
    fn top_and_bottom_double_their_row() {
        let mut patch = generate_base_patch(4, 1);
        stitch_patch_edge(&mut patch, Top).unwrap();
        stitch_patch_edge(&mut patch, Bottom).unwrap();

        let xs = |row: &Vec<Vec2>| row.iter().map(|v| v.x).collect_vec();
        assert_eq!(xs(&patch.rows[0]), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(xs(&patch.rows[2]), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(xs(&patch.rows[1]), vec![0.0, 2.0, 4.0]);
        assert!(patch.rows[2].iter().all(|v| v.y == 4.0));
    }

    #[test]
    fn midpoint_of_the_corrective_column() {
        let mut patch = generate_base_patch(10, 2);
        stitch_patch_edge(&mut patch, Top).unwrap();

        assert_eq!(patch.rows[0][7], Vec2::new(9.5, 0.0));
        assert_eq!(patch.rows[0].last(), Some(&Vec2::new(10.0, 0.0)));
    }

    #[test]
    fn edge_sets_match_manual_stitching() {
        let edges = StitchedEdges::LEFT | StitchedEdges::BOTTOM;
        let patch = TerrainPatch::with_stitched_edges(16, 1, edges);

        let mut manual = generate_base_patch(16, 1);
        stitch_patch_edge(&mut manual, Left).unwrap();
        stitch_patch_edge(&mut manual, Bottom).unwrap();

        assert_eq!(patch.stitched_edges(), edges);
        assert_eq!(patch.rows, manual.rows);
    }
}
