// Copyright 2020 Joyent, Inc.

//! Partitioners and the token ring used for data-locality routing.
//!
//! A partitioner maps a partition key to a [`Token`](enum.Token.html). Each
//! node owns a set of tokens, and a key belongs to the node owning the first
//! token greater than or equal to the key's token, wrapping around to the
//! smallest token past the end of the ring.

mod murmur;

use std::cmp::Ordering;
use std::fmt;

use md5::{Digest, Md5};

use crate::error::Error;
use crate::host::Host;

pub use murmur::murmur3_h1;

/// A position on the ring.
///
/// Tokens from different partitioners are never compared with each other in
/// practice; a ring is always built from a single partitioner.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Murmur3(i64),
    OrderPreserving(Vec<u8>),
    Random(u128),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Token::Murmur3(t) => write!(f, "{}", t),
            Token::OrderPreserving(t) => write!(f, "{}", String::from_utf8_lossy(t)),
            Token::Random(t) => write!(f, "{}", t),
        }
    }
}

/// The strategy used to place partition keys on the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Partitioner {
    Murmur3,
    OrderPreserving,
    Random,
}

impl Partitioner {
    /// Look a partitioner up by the class name the cluster reports. Names are
    /// matched by suffix so fully qualified names work too.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        if name.ends_with("Murmur3Partitioner") {
            Ok(Partitioner::Murmur3)
        } else if name.ends_with("OrderedPartitioner")
            || name.ends_with("OrderPreservingPartitioner")
        {
            Ok(Partitioner::OrderPreserving)
        } else if name.ends_with("RandomPartitioner") {
            Ok(Partitioner::Random)
        } else {
            Err(Error::UnknownPartitioner(name.to_string()))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Partitioner::Murmur3 => "Murmur3Partitioner",
            Partitioner::OrderPreserving => "OrderedPartitioner",
            Partitioner::Random => "RandomPartitioner",
        }
    }

    pub fn hash(self, key: &[u8]) -> Token {
        match self {
            Partitioner::Murmur3 => Token::Murmur3(murmur3_h1(key)),
            Partitioner::OrderPreserving => Token::OrderPreserving(key.to_vec()),
            Partitioner::Random => {
                let digest = Md5::digest(key);
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&digest);
                // The digest is read as a signed big-endian integer and the
                // absolute value taken.
                Token::Random(i128::from_be_bytes(bytes).unsigned_abs())
            }
        }
    }

    /// Parse a token as it appears in the cluster's system tables.
    pub fn parse(self, s: &str) -> Result<Token, Error> {
        match self {
            Partitioner::Murmur3 => s
                .trim()
                .parse::<i64>()
                .map(Token::Murmur3)
                .map_err(|_| Error::InvalidToken(s.to_string())),
            Partitioner::OrderPreserving => {
                Ok(Token::OrderPreserving(s.as_bytes().to_vec()))
            }
            Partitioner::Random => s
                .trim()
                .parse::<u128>()
                .map(Token::Random)
                .map_err(|_| Error::InvalidToken(s.to_string())),
        }
    }
}

impl fmt::Display for Partitioner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable, sorted token ring.
///
/// `tokens[i]` is owned by `hosts[i]`; both are sorted by token. A new ring is
/// built whenever membership or the partitioner changes.
#[derive(Debug)]
pub struct TokenRing {
    partitioner: Partitioner,
    tokens: Vec<Token>,
    hosts: Vec<Host>,
}

impl TokenRing {
    pub fn new(partitioner: &str, hosts: &[Host]) -> Result<Self, Error> {
        let partitioner = Partitioner::from_name(partitioner)?;

        let mut pairs = Vec::new();
        for host in hosts {
            for token in host.tokens() {
                pairs.push((partitioner.parse(&token)?, host.clone()));
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let (tokens, hosts) = pairs.into_iter().unzip();
        Ok(TokenRing {
            partitioner,
            tokens,
            hosts,
        })
    }

    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The host owning the given partition key.
    pub fn host_for(&self, key: &[u8]) -> Option<Host> {
        self.host_for_token(&self.partitioner.hash(key))
    }

    /// The host owning the first token not less than `token`, wrapping to the
    /// start of the ring.
    pub fn host_for_token(&self, token: &Token) -> Option<Host> {
        if self.tokens.is_empty() {
            return None;
        }
        let idx = match self.tokens.binary_search_by(|t| match t.cmp(token) {
            // Land on the first of a run of equal tokens.
            Ordering::Equal => Ordering::Greater,
            other => other,
        }) {
            Ok(i) | Err(i) => i,
        };
        let idx = if idx >= self.tokens.len() { 0 } else { idx };
        Some(self.hosts[idx].clone())
    }
}

impl fmt::Display for TokenRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TokenRing({}){{", self.partitioner)?;
        for (i, (token, host)) in self.tokens.iter().zip(self.hosts.iter()).enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {}", token, host.connect_address())?;
        }
        write!(f, " }}")
    }
}
