use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::dlml::Dlml;
use crate::error::Result;

/// A partially filled board: one queen per row for rows `1..row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Column (`1..=size`) of the queen in each row; 0 while empty.
    pub cells: Vec<u32>,
    /// 1-based row the next queen goes into.
    pub row: usize,
}

/// Result of expanding one board.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expansion {
    /// Boards with one more queen placed, in column order.
    pub children: Vec<Board>,
    /// Complete boards reached from this one.
    pub solutions: u64,
}

impl Board {
    /// Empty `size` x `size` board.
    pub fn new(size: usize) -> Self {
        Self {
            cells: vec![0; size],
            row: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Whether a queen in column `col` of the current row is attacked by one
    /// of the queens already placed.
    pub fn is_attacked(&self, col: u32) -> bool {
        let current = self.row - 1;
        self.cells[..current].iter().enumerate().any(|(i, &placed)| {
            let distance = (current - i) as u32;
            placed == col || placed + distance == col || col + distance == placed
        })
    }

    /// Try every column of the current row.
    pub fn expand(&self) -> Expansion {
        let size = self.size();
        let mut expansion = Expansion::default();
        for col in 1..=size as u32 {
            if self.is_attacked(col) {
                continue;
            }
            if self.row < size {
                let mut child = self.clone();
                child.cells[self.row - 1] = col;
                child.row += 1;
                expansion.children.push(child);
            } else {
                expansion.solutions += 1;
            }
        }
        expansion
    }
}

/// Explore boards until the group runs out of work. Returns the solutions
/// found on this rank.
pub async fn search<C: Codec>(dlml: &mut Dlml<Board, C>) -> Result<u64> {
    let mut solutions = 0;
    let mut boards = 0u64;
    while let Some(board) = dlml.get().await? {
        let Expansion {
            children,
            solutions: found,
        } = board.expand();
        solutions += found;
        boards += 1;
        for child in children {
            dlml.insert(child);
        }
    }
    tracing::info!(rank = dlml.rank(), boards, solutions, "Local search finished");
    Ok(solutions)
}

/// Count the solutions for a `size` x `size` board over the whole group.
///
/// The root seeds the search with the empty board. The root gets the total;
/// other ranks get their own share.
pub async fn count_solutions<C: Codec>(dlml: &mut Dlml<Board, C>, size: usize) -> Result<u64> {
    if dlml.is_root() {
        dlml.insert(Board::new(size));
    }
    let local = search(dlml).await?;
    dlml.reduce_add(local).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalanceConfig;
    use crate::transport::MemoryNetwork;

    fn board(cells: &[u32], row: usize) -> Board {
        Board {
            cells: cells.to_vec(),
            row,
        }
    }

    fn count_sequential(size: usize) -> u64 {
        let mut open = vec![Board::new(size)];
        let mut total = 0;
        while let Some(b) = open.pop() {
            let e = b.expand();
            total += e.solutions;
            open.extend(e.children);
        }
        total
    }

    #[test]
    fn attacks_follow_columns_and_diagonals() {
        // queen in row 1, column 2; filling row 2
        let b = board(&[2, 0, 0, 0], 2);
        assert!(b.is_attacked(2));
        assert!(b.is_attacked(1));
        assert!(b.is_attacked(3));
        assert!(!b.is_attacked(4));
    }

    #[test]
    fn first_row_is_never_attacked() {
        let b = Board::new(4);
        assert!((1..=4).all(|c| !b.is_attacked(c)));
        assert_eq!(b.expand().children.len(), 4);
    }

    #[test]
    fn last_row_counts_solutions() {
        // 2 4 1 _ has exactly one completion (3)
        let b = board(&[2, 4, 1, 0], 4);
        let e = b.expand();
        assert!(e.children.is_empty());
        assert_eq!(e.solutions, 1);
    }

    #[test]
    fn known_solution_counts() {
        assert_eq!(count_sequential(1), 1);
        assert_eq!(count_sequential(2), 0);
        assert_eq!(count_sequential(3), 0);
        assert_eq!(count_sequential(4), 2);
        assert_eq!(count_sequential(6), 4);
        assert_eq!(count_sequential(8), 92);
    }

    #[tokio::test]
    async fn single_rank_four_queens() {
        let ep = MemoryNetwork::endpoints(1).pop().unwrap();
        let mut dlml = Dlml::with_endpoint(ep, BalanceConfig::default()).unwrap();
        assert_eq!(count_solutions(&mut dlml, 4).await.unwrap(), 2);
        dlml.finalize().await.unwrap();
    }
}
