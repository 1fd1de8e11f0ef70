//! Map grid labels for world coordinates.
//!
//! The companion map is carved into square cells 146.3 world units wide.
//! Columns letter from the west edge (A..Z, then AA, AB, ..), rows number
//! from the north edge starting at 0, so the top-left cell is A0.

/// Width of one grid cell in world units.
pub const GRID_CELL: f64 = 146.3;

/// Grid label for a world position, e.g. "D7".
///
/// Coordinates outside the playable square (monuments can sit slightly
/// off-map) clamp to the border cell instead of producing nonsense labels.
pub fn grid_label(x: f64, y: f64, map_size: u32) -> String {
    let size = f64::from(map_size);
    let cells = ((size / GRID_CELL).floor() as i64).max(1);
    let col = ((x / GRID_CELL).floor() as i64).clamp(0, cells - 1);
    // World y grows south-to-north; grid rows count north-to-south.
    let row = (((size - y) / GRID_CELL).floor() as i64).clamp(0, cells - 1);
    format!("{}{}", column_letters(col), row)
}

/// Column index to letters in bijective base 26: 0 => A, 25 => Z, 26 => AA.
fn column_letters(mut col: i64) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (col % 26) as u8);
        col = col / 26 - 1;
        if col < 0 {
            break;
        }
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn northwest_corner_is_a0() {
        assert_eq!(grid_label(0.0, 4000.0, 4000), "A0");
    }

    #[test]
    fn southwest_corner_is_last_row() {
        // 4000 / 146.3 => 27 cells, rows 0..=26
        assert_eq!(grid_label(0.0, 0.0, 4000), "A26");
    }

    #[test]
    fn interior_cell() {
        // x in cell 3 (438.9..585.2), y 500 from the top => row 3
        assert_eq!(grid_label(450.0, 4000.0 - 500.0, 4000), "D3");
    }

    #[test]
    fn columns_extend_past_z() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(27), "AB");
        assert_eq!(column_letters(51), "AZ");
        assert_eq!(column_letters(52), "BA");
    }

    #[test]
    fn off_map_coordinates_clamp_to_border() {
        assert_eq!(grid_label(-200.0, 5000.0, 4000), "A0");
        let far = grid_label(10_000.0, -300.0, 4000);
        assert_eq!(far, "AA26");
    }

    #[test]
    fn tiny_map_still_labels() {
        assert_eq!(grid_label(50.0, 50.0, 100), "A0");
    }
}
