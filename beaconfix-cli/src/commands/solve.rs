//! Solve command - one-shot trilateration from three anchors.

use beaconfix::coord::Point2;
use beaconfix::trilateration::{self, Anchor};

use super::common::parse_numbers;
use crate::error::CliError;

/// Arguments for the solve command.
pub struct SolveArgs {
    /// Three `x,y,d` triples.
    pub anchors: Vec<String>,
    pub epsilon: f64,
}

/// Run the solve command.
pub fn run(args: SolveArgs) -> Result<(), CliError> {
    let point = solve(&args)?;
    println!("x = {:.4}", point.x);
    println!("y = {:.4}", point.y);
    Ok(())
}

fn solve(args: &SolveArgs) -> Result<Point2, CliError> {
    let [a1, a2, a3] = parse_anchors(&args.anchors)?;
    Ok(trilateration::solve(a1, a2, a3, args.epsilon)?)
}

fn parse_anchors(raw: &[String]) -> Result<[Anchor; 3], CliError> {
    if raw.len() != 3 {
        return Err(CliError::Config(format!(
            "exactly 3 anchors required, {} given",
            raw.len()
        )));
    }
    let mut anchors = [Anchor::new(Point2::origin(), 0.0); 3];
    for (slot, text) in anchors.iter_mut().zip(raw) {
        let [x, y, d] = parse_numbers::<3>(text)?;
        *slot = Anchor::new(Point2::new(x, y), d);
    }
    Ok(anchors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaconfix::trilateration::DEFAULT_DEGENERATE_EPSILON;

    fn args(anchors: &[&str]) -> SolveArgs {
        SolveArgs {
            anchors: anchors.iter().map(|s| s.to_string()).collect(),
            epsilon: DEFAULT_DEGENERATE_EPSILON,
        }
    }

    #[test]
    fn test_reference_scenario() {
        let d = 8f64.sqrt();
        let point = solve(&args(&[
            &format!("0,0,{}", d),
            &format!("4,0,{}", d),
            &format!("0,4,{}", d),
        ]))
        .unwrap();
        assert!((point.x - 2.0).abs() < 1e-9);
        assert!((point.y - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_collinear_is_solve_error() {
        let result = solve(&args(&["0,0,1", "1,0,1", "2,0,1"]));
        assert!(matches!(result, Err(CliError::Solve(_))));
    }

    #[test]
    fn test_anchor_count_checked() {
        let result = solve(&args(&["0,0,1", "1,0,1"]));
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
