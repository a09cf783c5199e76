//! Origin-destination demand matrices
//!
//! A [`DemandMatrix`] holds the trips of one traffic class, split into named
//! strata (user segments that share the class's graph but are loaded and
//! reported separately). Storage is one dense zones-by-zones plane per
//! stratum.

use anyhow::{anyhow, Result};

/// Dense OD demand, `strata` planes of `zones x zones` trips.
#[derive(Debug, Clone)]
pub struct DemandMatrix {
    zones: usize,
    strata: Vec<String>,
    /// `[stratum * zones * zones + origin * zones + destination]`
    data: Vec<f64>,
}

impl DemandMatrix {
    /// All-zero demand with the given stratum names.
    pub fn new(zones: usize, strata: Vec<String>) -> Result<Self> {
        if zones == 0 {
            return Err(anyhow!("Demand matrix needs at least one zone"));
        }
        if strata.is_empty() {
            return Err(anyhow!("Demand matrix needs at least one stratum"));
        }
        let len = strata.len() * zones * zones;
        Ok(Self {
            zones,
            strata,
            data: vec![0.0; len],
        })
    }

    /// Single-stratum matrix from a flat zones-by-zones plane.
    pub fn from_plane(zones: usize, name: &str, plane: Vec<f64>) -> Result<Self> {
        if plane.len() != zones * zones {
            return Err(anyhow!(
                "Demand plane has {} cells for {} zones",
                plane.len(),
                zones
            ));
        }
        Ok(Self {
            zones,
            strata: vec![name.to_string()],
            data: plane,
        })
    }

    pub fn zones(&self) -> usize {
        self.zones
    }

    pub fn num_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn strata(&self) -> &[String] {
        &self.strata
    }

    #[inline]
    pub fn demand(&self, stratum: usize, origin: usize, destination: usize) -> f64 {
        self.data[stratum * self.zones * self.zones + origin * self.zones + destination]
    }

    pub fn set_demand(&mut self, stratum: usize, origin: usize, destination: usize, trips: f64) {
        self.data[stratum * self.zones * self.zones + origin * self.zones + destination] = trips;
    }

    /// Total trips leaving `origin` across all strata and destinations.
    pub fn origin_total(&self, origin: usize) -> f64 {
        let mut total = 0.0;
        for stratum in 0..self.strata.len() {
            let base = stratum * self.zones * self.zones + origin * self.zones;
            total += self.data[base..base + self.zones].iter().sum::<f64>();
        }
        total
    }

    /// Total trips in the matrix.
    pub fn total_demand(&self) -> f64 {
        self.data.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_plane_shape_checked() {
        assert!(DemandMatrix::from_plane(2, "car", vec![0.0; 3]).is_err());
        assert!(DemandMatrix::from_plane(2, "car", vec![0.0; 4]).is_ok());
    }

    #[test]
    fn test_demand_roundtrip() {
        let mut matrix = DemandMatrix::new(3, vec!["car".into(), "hov".into()]).unwrap();
        matrix.set_demand(1, 0, 2, 150.0);
        assert_eq!(matrix.demand(1, 0, 2), 150.0);
        assert_eq!(matrix.demand(0, 0, 2), 0.0);
        assert_eq!(matrix.origin_total(0), 150.0);
        assert_eq!(matrix.origin_total(1), 0.0);
        assert_eq!(matrix.total_demand(), 150.0);
    }
}
