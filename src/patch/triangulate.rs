use crate::patch::{StitchedEdges, TerrainPatch};
use itertools::Itertools;

/// Maps a (row, column) position of a patch to its flat vertex index.
pub struct RowOffsets(Vec<u32>);

impl RowOffsets {
    pub fn new(patch: &TerrainPatch) -> Self {
        let offsets = patch
            .rows
            .iter()
            .scan(0, |offset, row| {
                let start = *offset;
                *offset += row.len() as u32;
                Some(start)
            })
            .collect();

        Self(offsets)
    }

    #[inline]
    pub fn index(&self, row: usize, column: usize) -> u32 {
        self.0[row] + column as u32
    }
}

#[derive(Clone, Copy)]
struct CellVertex {
    index: u32,
    midpoint: bool,
}

impl CellVertex {
    fn corner(index: u32) -> Self {
        Self {
            index,
            midpoint: false,
        }
    }

    fn midpoint(index: u32) -> Self {
        Self {
            index,
            midpoint: true,
        }
    }
}

/// Emits the triangles of a single grid cell.
///
/// The ring lists the boundary of the cell counter clockwise (seen from above), starting at the
/// corner with the smallest coordinates. A cell without inserted midpoints is split into two
/// triangles, otherwise the ring is fanned from its first midpoint.
fn triangulate_cell(ring: &[CellVertex], indices: &mut Vec<u32>) {
    match ring.iter().position(|vertex| vertex.midpoint) {
        None => {
            let [a, b, c, d] = [ring[0].index, ring[1].index, ring[2].index, ring[3].index];
            indices.extend([a, b, c, a, c, d]);
        }
        Some(start) => {
            let apex = ring[start].index;

            for (b, c) in ring
                .iter()
                .cycle()
                .skip(start + 1)
                .take(ring.len() - 1)
                .tuple_windows()
            {
                indices.extend([apex, b.index, c.index]);
            }
        }
    }
}

/// Converts the rows of a patch into a triangle list with a counter clockwise winding
/// when viewed from above.
///
/// Seam rows inserted by stitching a side edge never act as cell corners. Instead, every cell
/// adjacent to a stitched edge is triangulated as a fan around its seam vertex.
pub fn triangulate_patch(patch: &TerrainPatch) -> Vec<u32> {
    let offsets = RowOffsets::new(patch);
    let stitched = patch.stitched;
    let grid_rows = patch.grid_rows().collect_vec();

    // stitched top and bottom rows contain a midpoint between each pair of columns
    let doubled = |grid_row: usize| {
        (grid_row == 0 && stitched.contains(StitchedEdges::TOP))
            || (grid_row == grid_rows.len() - 1 && stitched.contains(StitchedEdges::BOTTOM))
    };
    let column = |grid_row: usize, column: usize| {
        if doubled(grid_row) {
            2 * column
        } else {
            column
        }
    };

    let first_row = patch.rows[0].len();
    let column_count = if doubled(0) {
        (first_row + 1) / 2
    } else {
        first_row
    };
    let cell_count = (grid_rows.len() - 1) * (column_count - 1);

    let mut indices = Vec::with_capacity(cell_count * 6);
    let mut ring = Vec::with_capacity(8);

    for (top, (&row0, &row1)) in grid_rows.iter().tuple_windows().enumerate() {
        let bottom = top + 1;
        let seam_row = row0 + 1;

        for c in 0..column_count - 1 {
            ring.clear();

            ring.push(CellVertex::corner(offsets.index(row0, column(top, c))));
            if c == 0 && stitched.contains(StitchedEdges::LEFT) {
                ring.push(CellVertex::midpoint(offsets.index(seam_row, 0)));
            }
            ring.push(CellVertex::corner(offsets.index(row1, column(bottom, c))));
            if doubled(bottom) {
                ring.push(CellVertex::midpoint(offsets.index(row1, 2 * c + 1)));
            }
            ring.push(CellVertex::corner(offsets.index(row1, column(bottom, c + 1))));
            if c + 1 == column_count - 1 && stitched.contains(StitchedEdges::RIGHT) {
                let last = patch.rows[seam_row].len() - 1;
                ring.push(CellVertex::midpoint(offsets.index(seam_row, last)));
            }
            ring.push(CellVertex::corner(offsets.index(row0, column(top, c + 1))));
            if doubled(top) {
                ring.push(CellVertex::midpoint(offsets.index(row0, 2 * c + 1)));
            }

            triangulate_cell(&ring, &mut indices);
        }
    }

    indices
}
