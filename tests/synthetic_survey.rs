//! Synthetic survey replay: a noisy sloping seafloor sampled across four
//! tiles must read back close to the true surface wherever coverage is
//! dense, with no NaN leaking into covered nodes.

use std::time::Instant;

use bathycube::{CellCounts, CellSizes, GridIndex, IhoOrder, MapSheet, Sounding};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Gentle slope dipping east and north.
fn true_depth(x: f64, y: f64) -> f64 {
    15.0 + 0.05 * x + 0.02 * y
}

#[test]
fn test_sloping_seafloor_readback() {
    let mut rng = StdRng::seed_from_u64(7);
    let noise = Normal::new(0.0, 0.05).expect("valid noise distribution");

    let mut sheet = MapSheet::new(
        CellCounts::square(20),
        CellSizes::square(1.0),
        IhoOrder::Order1a,
    )
    .expect("valid sheet geometry");

    // 4000 soundings over [1, 39)^2: four tiles, with a margin so no
    // influence radius escapes past the outer tile ring.
    let soundings: Vec<Sounding> = (0..4000)
        .map(|_| {
            let x = rng.gen_range(1.0..39.0);
            let y = rng.gen_range(1.0..39.0);
            let depth = (true_depth(x, y) + noise.sample(&mut rng)) as f32;
            Sounding::new(x, y, depth, 0.01, 0.01)
        })
        .collect();

    for batch in soundings.chunks(500) {
        assert!(sheet.add_soundings(batch, Instant::now()));
    }

    assert_eq!(sheet.grid_count(), 4, "the survey spans exactly four tiles");

    let mut covered = 0usize;
    let mut total_abs_error = 0.0f64;
    let mut worst = 0.0f64;

    for tile_y in 0..2 {
        for tile_x in 0..2 {
            let index = GridIndex::new(tile_x, tile_y);
            let values = sheet.grid_values(index).expect("tile exists");
            assert_eq!(values.len(), 400);

            for (slot, value) in values.iter().enumerate() {
                if value.is_no_data() {
                    continue;
                }
                covered += 1;

                let col = (slot % 20) as f64;
                let row = (slot / 20) as f64;
                let node_x = f64::from(tile_x) * 20.0 + col;
                let node_y = f64::from(tile_y) * 20.0 + row;

                let error = (f64::from(value.depth) - true_depth(node_x, node_y)).abs();
                total_abs_error += error;
                worst = worst.max(error);

                assert!(
                    value.uncertainty > 0.0 && value.uncertainty.is_finite(),
                    "covered node ({node_x}, {node_y}) must report a finite uncertainty"
                );
            }
        }
    }

    assert!(
        covered > 800,
        "most interior nodes should see data, got {covered} of 1600"
    );
    assert!(
        total_abs_error / (covered as f64) < 0.1,
        "mean absolute error too large: {}",
        total_abs_error / (covered as f64)
    );
    assert!(worst < 0.5, "worst node error too large: {worst}");
}
