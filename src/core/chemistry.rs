use serde::{Deserialize, Serialize};

/// Morse well parameters for one unordered species pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MorseParams {
    /// Well depth (eV).
    pub depth: f64,
    /// Width parameter (1/Å).
    pub alpha: f64,
    /// Equilibrium separation (Å).
    pub r0: f64,
}

/// A flattened 2D matrix storing pair parameters per species pair.
/// Access is O(1) via `index = i * N + j`; the matrix is kept symmetric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairTable {
    num_species: usize,
    entries: Vec<Option<MorseParams>>,
}

impl PairTable {
    pub fn new(num_species: usize) -> Self {
        Self {
            num_species,
            entries: vec![None; num_species * num_species],
        }
    }

    /// Stores `params` for both (i, j) and (j, i).
    pub fn set(&mut self, i: usize, j: usize, params: MorseParams) {
        let n = self.num_species;
        self.entries[i * n + j] = Some(params);
        self.entries[j * n + i] = Some(params);
    }

    #[inline(always)]
    pub fn get(&self, i: usize, j: usize) -> Option<&MorseParams> {
        self.entries
            .get(i * self.num_species + j)
            .and_then(|e| e.as_ref())
    }

    /// Index pairs with no parameters, upper triangle only.
    pub fn missing_pairs(&self) -> Vec<(usize, usize)> {
        let n = self.num_species;
        let mut missing = Vec::new();
        for i in 0..n {
            for j in i..n {
                if self.entries[i * n + j].is_none() {
                    missing.push((i, j));
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_symmetric() {
        let mut table = PairTable::new(2);
        let p = MorseParams { depth: 1.0, alpha: 2.0, r0: 0.9 };
        table.set(0, 1, p);
        assert_eq!(table.get(1, 0), Some(&p));
        assert_eq!(table.get(0, 1), Some(&p));
        assert_eq!(table.missing_pairs(), vec![(0, 0), (1, 1)]);
    }
}
