use crate::history::{Column, Frame, LOCAL_PT, NUM_ACTIVE_RUNS, X, X_ON_CUBE};

/// Build the frame for a batch of proposed points: the raw coordinates plus
/// their projection onto the unit cube, and for local moves the local point
/// marker with one active run. The distance bookkeeping columns start at
/// their ledger defaults and are not part of the proposal.
pub fn proposal_frame(points: &[Vec<f64>], lb: &[f64], ub: &[f64], local: bool) -> Frame {
    let dim = lb.len();
    let mut x = Vec::with_capacity(points.len() * dim);
    let mut on_cube = Vec::with_capacity(points.len() * dim);

    for point in points {
        for d in 0..dim {
            x.push(point[d]);
            on_cube.push((point[d] - lb[d]) / (ub[d] - lb[d]));
        }
    }

    let mut frame = Frame::new(points.len());
    frame.insert(X, Column::FloatVec { dim, data: x }).unwrap();
    frame
        .insert(X_ON_CUBE, Column::FloatVec { dim, data: on_cube })
        .unwrap();
    if local {
        frame
            .insert(LOCAL_PT, Column::Bool(vec![true; points.len()]))
            .unwrap();
        frame
            .insert(NUM_ACTIVE_RUNS, Column::Int(vec![1; points.len()]))
            .unwrap();
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_points_onto_the_unit_cube() {
        let frame = proposal_frame(&[vec![-1.0, 5.0]], &[-3.0, 0.0], &[3.0, 10.0], false);
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.column(X).unwrap().vec(0), &[-1.0, 5.0]);
        let cube = frame.column(X_ON_CUBE).unwrap().vec(0).to_vec();
        assert!((cube[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((cube[1] - 0.5).abs() < 1e-12);
        assert!(frame.get(LOCAL_PT).is_none());
    }

    #[test]
    fn local_moves_carry_the_local_marker() {
        let frame = proposal_frame(&[vec![0.5], vec![0.6]], &[0.0], &[1.0], true);
        assert!(frame.column(LOCAL_PT).unwrap().flag(1));
        assert_eq!(frame.column(NUM_ACTIVE_RUNS).unwrap().int(0), 1);
    }
}
