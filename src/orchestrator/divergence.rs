//! Species-tree distances used to tune the blast identity filter.

use crate::errors::ConfigError;

/// A parsed newick node. Only branch lengths matter here.
#[derive(Debug, Clone, PartialEq)]
struct TreeNode {
    distance: f64,
    children: Vec<TreeNode>,
}

impl TreeNode {
    /// Longest path from this node to any leaf, using absolute branch lengths.
    fn longest_path(&self) -> f64 {
        self.children
            .iter()
            .map(|c| c.distance.abs() + c.longest_path())
            .fold(0.0, f64::max)
    }
}

struct NewickParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> NewickParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "species tree: {} at offset {}",
            message, self.pos
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_tree(mut self) -> Result<TreeNode, ConfigError> {
        let root = self.parse_node()?;
        self.skip_whitespace();
        if self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_whitespace();
        }
        if self.pos != self.input.len() {
            return Err(self.error("trailing input"));
        }
        Ok(root)
    }

    fn parse_node(&mut self) -> Result<TreeNode, ConfigError> {
        self.skip_whitespace();
        let mut children = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                children.push(self.parse_node()?);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
        self.skip_label();
        self.skip_whitespace();
        let distance = if self.peek() == Some(b':') {
            self.pos += 1;
            self.parse_number()?
        } else {
            0.0
        };
        Ok(TreeNode { distance, children })
    }

    fn skip_label(&mut self) {
        while self
            .peek()
            .is_some_and(|c| !matches!(c, b':' | b',' | b')' | b'(' | b';'))
        {
            self.pos += 1;
        }
    }

    fn parse_number(&mut self) -> Result<f64, ConfigError> {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, b'.' | b'-' | b'+' | b'e' | b'E'))
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| d.is_finite())
            .ok_or_else(|| self.error("invalid branch length"))
    }
}

/// Longest root-to-leaf distance of a newick tree. The root's own branch is ignored.
pub fn longest_path(newick: &str) -> Result<f64, ConfigError> {
    Ok(NewickParser::new(newick).parse_tree()?.longest_path())
}

/// Minimum percent identity for blast hits at a given divergence.
///
/// Inverts the Jukes-Cantor correction at `max(ratio * divergence, minimum_distance)`.
pub fn identity_threshold(divergence: f64, ratio: f64, minimum_distance: f64) -> u32 {
    let distance = (ratio * divergence).max(minimum_distance);
    let mismatch = 0.75 * (1.0 - (-4.0 / 3.0 * distance).exp());
    let identity = 100.0 - (100.0 * mismatch).ceil();
    identity.clamp(0.0, 100.0) as u32
}
