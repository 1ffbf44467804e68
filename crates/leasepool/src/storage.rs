//! Containers for unleased tokens.
//!
//! The manager only needs add / remove-one / peek / size; which token
//! `remove` yields is the strategy's business, as long as every token that
//! goes in eventually comes out.

use std::collections::VecDeque;
use std::str::FromStr;

use serde::Serialize;

pub(crate) trait PoolStorage<T>: Send {
    fn add(&mut self, token: T);

    fn remove(&mut self) -> Option<T>;

    /// The token the next `remove` would yield.
    fn peek(&self) -> Option<&T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Most recently released token first.
#[derive(Debug)]
pub(crate) struct Lifo<T>(Vec<T>);

impl<T> Default for Lifo<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Send> PoolStorage<T> for Lifo<T> {
    fn add(&mut self, token: T) {
        self.0.push(token);
    }

    fn remove(&mut self) -> Option<T> {
        self.0.pop()
    }

    fn peek(&self) -> Option<&T> {
        self.0.last()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Oldest token first.
#[derive(Debug)]
pub(crate) struct Fifo<T>(VecDeque<T>);

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T: Send> PoolStorage<T> for Fifo<T> {
    fn add(&mut self, token: T) {
        self.0.push_back(token);
    }

    fn remove(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn peek(&self) -> Option<&T> {
        self.0.front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Which built-in storage a manager uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategy {
    /// Stack: keeps a hot working set and lets idle tokens age.
    #[default]
    Lifo,
    /// Queue: spreads use evenly across tokens.
    Fifo,
}

impl StorageStrategy {
    pub(crate) fn build<T: Send + 'static>(self) -> Box<dyn PoolStorage<T>> {
        match self {
            Self::Lifo => Box::new(Lifo::default()),
            Self::Fifo => Box::new(Fifo::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifo => "lifo",
            Self::Fifo => "fifo",
        }
    }
}

impl FromStr for StorageStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lifo" | "stack" => Ok(Self::Lifo),
            "fifo" | "queue" => Ok(Self::Fifo),
            other => Err(format!("unknown storage strategy: {other}")),
        }
    }
}
