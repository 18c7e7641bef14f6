use std::collections::BTreeSet;

use proptest::prelude::*;
use sweep_core::{Dimension, Grid, GridError};

fn grid_from_sizes(sizes: &[usize]) -> Grid {
    let dims = sizes
        .iter()
        .enumerate()
        .map(|(i, &n)| Dimension {
            name: format!("d{}", i),
            cell: format!("B{}", i + 1),
            check_cell: format!("I{}", i + 1),
            // Distinct value per (dimension, position) so collisions in the
            // decoded output would be visible.
            values: (0..n).map(|p| (i * 100 + p) as f64).collect(),
        })
        .collect();
    Grid::new(dims).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn decode_is_a_bijection_over_the_full_range(
        sizes in proptest::collection::vec(1usize..=5, 1..=5),
    ) {
        let grid = grid_from_sizes(&sizes);
        let total = grid.total_count();
        prop_assert_eq!(total, sizes.iter().map(|&n| n as u64).product::<u64>());

        let mut seen = BTreeSet::new();
        for index in 0..total {
            let combo = grid.decode(index).unwrap();
            for (&pos, &size) in combo.positions.iter().zip(&sizes) {
                prop_assert!(pos < size);
            }
            prop_assert_eq!(grid.encode(&combo.positions).unwrap(), index);
            seen.insert(combo.positions);
        }
        prop_assert_eq!(seen.len() as u64, total);
    }

    #[test]
    fn indices_at_or_past_total_are_rejected(
        sizes in proptest::collection::vec(1usize..=5, 1..=5),
        offset in 0u64..1000,
    ) {
        let grid = grid_from_sizes(&sizes);
        let index = grid.total_count() + offset;
        prop_assert!(
            matches!(
                grid.decode(index),
                Err(GridError::IndexOutOfRange { .. })
            ),
            "decode must reject out-of-range index {}",
            index
        );
    }

    #[test]
    fn decode_twice_yields_identical_combinations(
        sizes in proptest::collection::vec(1usize..=4, 1..=6),
        seed in any::<u64>(),
    ) {
        let grid = grid_from_sizes(&sizes);
        let index = seed % grid.total_count();
        prop_assert_eq!(grid.decode(index).unwrap(), grid.decode(index).unwrap());
    }
}
