//! The determinant puzzle: matrix derivation and evaluation.

use shared_types::{Hash, U256};

/// Side length of the puzzle matrix.
pub const MATRIX_DIM: usize = 30;

/// Height at which the strengthened matrix generator activates.
pub const EMERY_FORK_HEIGHT: u64 = 2_500_000;

/// Difficulty-to-target multiplier.
const TARGET_MULTIPLIER: u64 = 3_000_000_000;

/// Upper bound on reachable 30×30 determinants; the target is capped here.
const MAX_DET_30X30: f64 = 2.0e30;

/// Deterministic generator behind the matrix derivation. The hardened
/// variant (post-fork) mixes the raw stream through an extra xorshift round.
struct MatrixRng {
    state: u64,
    hardened: bool,
}

impl MatrixRng {
    fn new(seed: u64, hardened: bool) -> Self {
        // Decorrelate adjacent seeds before the first draw.
        let state = (seed ^ 0x9E37_79B9_7F4A_7C15).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        Self { state, hardened }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let mut out = self.state;
        if self.hardened {
            out ^= out >> 31;
            out = out.wrapping_mul(0xD6E8_FEB8_6659_FD93);
            out ^= out >> 32;
        }
        out
    }

    fn next_below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Derive the puzzle matrix from a header hash.
///
/// The hash is folded into four 64-bit words; each row reseeds the generator
/// from the running xor of those words and the previous row's last draw, so
/// every row depends on the whole hash.
pub fn generate_matrix(hash: &Hash, height: u64) -> Vec<Vec<f64>> {
    let bytes = hash.as_bytes();
    let mut words = [0u64; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u64::from_be_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
    }

    let hardened = height >= EMERY_FORK_HEIGHT;
    let mut matrix = vec![vec![0.0f64; MATRIX_DIM]; MATRIX_DIM];
    let mut current = 0u64;

    for (i, row) in matrix.iter_mut().enumerate() {
        current ^= words[i % 4];
        let mut rng = MatrixRng::new(current, hardened);
        for cell in row.iter_mut() {
            current = rng.next_below((1 << 63) - 1);
            *cell = rng.next_below(3) as f64;
        }
    }

    matrix
}

/// Determinant by LU elimination with partial pivoting.
pub fn determinant(mut matrix: Vec<Vec<f64>>) -> f64 {
    let n = matrix.len();
    let mut det = 1.0f64;

    for col in 0..n {
        let mut pivot = col;
        for row in col + 1..n {
            if matrix[row][col].abs() > matrix[pivot][col].abs() {
                pivot = row;
            }
        }
        if matrix[pivot][col] == 0.0 {
            return 0.0;
        }
        if pivot != col {
            matrix.swap(pivot, col);
            det = -det;
        }
        det *= matrix[col][col];
        for row in col + 1..n {
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..n {
                matrix[row][k] -= factor * matrix[col][k];
            }
        }
    }

    det
}

/// Mining target for a difficulty: `difficulty × 3·10⁹`, capped at the
/// largest reachable determinant.
pub fn mining_target(difficulty: U256) -> f64 {
    let scaled = difficulty.saturating_mul(U256::from(TARGET_MULTIPLIER));
    let cap = U256::from(2u64) * U256::exp10(30);
    if scaled > cap {
        return MAX_DET_30X30;
    }
    // Values at or below the cap fit comfortably in 128 bits.
    scaled.low_u128() as f64
}

/// Whether a header hash satisfies the target for the given difficulty.
pub fn satisfies_target(hash: &Hash, height: u64, difficulty: U256) -> bool {
    let det = determinant(generate_matrix(hash, height));
    det.abs() >= mining_target(difficulty)
}
