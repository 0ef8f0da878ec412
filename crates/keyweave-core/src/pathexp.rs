// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Path expressions: hierarchical scopes for keyrings and credentials.
//!
//! A path has six segments, `/org/project/environment/service/identity/instance`.
//! A [`ResourcePath`] names one concrete resource; a [`PathExp`] names a set of
//! them, and each non-org segment may be:
//!
//! - a literal slug (`web`)
//! - a full wildcard (`*`)
//! - a prefix glob (`web*`)
//! - an alternation of literals (`[web|api]`)
//!
//! When several expressions match a path, the one with the greatest
//! [`Specificity`] wins.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

pub const SEGMENT_COUNT: usize = 6;
pub const SEGMENT_NAMES: [&str; SEGMENT_COUNT] = [
	"org",
	"project",
	"environment",
	"service",
	"identity",
	"instance",
];
const MAX_SLUG_LEN: usize = 64;

fn is_slug(s: &str) -> bool {
	let mut chars = s.chars();
	match chars.next() {
		Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
		_ => return false,
	}
	s.len() <= MAX_SLUG_LEN
		&& chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn split_segments(input: &str) -> std::result::Result<Vec<String>, String> {
	let trimmed = input.trim();
	let body = trimmed.strip_prefix('/').unwrap_or(trimmed);
	let parts: Vec<String> = body.split('/').map(|p| p.to_ascii_lowercase()).collect();
	if parts.len() != SEGMENT_COUNT {
		return Err(format!(
			"expected {SEGMENT_COUNT} segments ({}), got {}",
			SEGMENT_NAMES.join("/"),
			parts.len()
		));
	}
	Ok(parts)
}

// =============================================================================
// Segment
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
	Literal(String),
	/// Sorted, deduplicated, at least two members.
	Alternation(Vec<String>),
	Prefix(String),
	Wildcard,
}

impl Segment {
	fn parse(raw: &str) -> std::result::Result<Self, String> {
		if raw == "*" {
			return Ok(Segment::Wildcard);
		}

		if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
			let mut values: Vec<String> = inner.split('|').map(str::to_string).collect();
			if let Some(bad) = values.iter().find(|v| !is_slug(v)) {
				return Err(format!("alternation member {bad:?} is not a valid name"));
			}
			values.sort();
			values.dedup();
			return Ok(match values.len() {
				1 => Segment::Literal(values.remove(0)),
				_ => Segment::Alternation(values),
			});
		}

		if let Some(prefix) = raw.strip_suffix('*') {
			if !is_slug(prefix) {
				return Err(format!("glob prefix {prefix:?} is not a valid name"));
			}
			return Ok(Segment::Prefix(prefix.to_string()));
		}

		if is_slug(raw) {
			Ok(Segment::Literal(raw.to_string()))
		} else {
			Err(format!("segment {raw:?} is not a valid name"))
		}
	}

	pub fn matches(&self, value: &str) -> bool {
		match self {
			Segment::Literal(l) => l == value,
			Segment::Alternation(values) => values.iter().any(|v| v == value),
			Segment::Prefix(p) => value.starts_with(p.as_str()),
			Segment::Wildcard => true,
		}
	}

	/// Whether some concrete value satisfies both segments.
	pub fn overlaps(&self, other: &Segment) -> bool {
		match (self, other) {
			(Segment::Wildcard, _) | (_, Segment::Wildcard) => true,
			(Segment::Literal(l), s) | (s, Segment::Literal(l)) => s.matches(l),
			(Segment::Prefix(a), Segment::Prefix(b)) => a.starts_with(b.as_str()) || b.starts_with(a.as_str()),
			(Segment::Prefix(p), Segment::Alternation(values))
			| (Segment::Alternation(values), Segment::Prefix(p)) => {
				values.iter().any(|v| v.starts_with(p.as_str()))
			}
			(Segment::Alternation(a), Segment::Alternation(b)) => a.iter().any(|v| b.contains(v)),
		}
	}

	pub fn is_wildcard(&self) -> bool {
		matches!(self, Segment::Wildcard)
	}

	fn weight(&self) -> u8 {
		match self {
			Segment::Literal(_) => 3,
			Segment::Alternation(_) => 2,
			Segment::Prefix(_) => 1,
			Segment::Wildcard => 0,
		}
	}
}

impl fmt::Display for Segment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Segment::Literal(l) => f.write_str(l),
			Segment::Alternation(values) => write!(f, "[{}]", values.join("|")),
			Segment::Prefix(p) => write!(f, "{p}*"),
			Segment::Wildcard => f.write_str("*"),
		}
	}
}

// =============================================================================
// Specificity
// =============================================================================

/// Ordering key for path expressions; greater is more specific.
///
/// Compares the number of full wildcards first (fewer wins), then segment
/// strength left to right: literal, alternation, prefix glob, wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
	wildcards: Reverse<u8>,
	weights: [u8; SEGMENT_COUNT],
}

impl Specificity {
	pub fn wildcards(&self) -> u8 {
		self.wildcards.0
	}
}

// =============================================================================
// PathExp
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathExp {
	segments: [Segment; SEGMENT_COUNT],
}

impl PathExp {
	pub fn parse(input: &str) -> Result<Self> {
		let invalid = |reason: String| Error::InvalidPathExp {
			input: input.to_string(),
			reason,
		};

		let parts = split_segments(input).map_err(invalid)?;
		let segments = parts
			.iter()
			.zip(SEGMENT_NAMES)
			.map(|(raw, name)| Segment::parse(raw).map_err(|e| invalid(format!("{name}: {e}"))))
			.collect::<Result<Vec<_>>>()?;

		Self::from_segments(segments).map_err(|e| match e {
			Error::InvalidPathExp { reason, .. } => invalid(reason),
			other => other,
		})
	}

	pub fn from_segments(segments: Vec<Segment>) -> Result<Self> {
		let segments: [Segment; SEGMENT_COUNT] =
			segments.try_into().map_err(|s: Vec<Segment>| Error::InvalidPathExp {
				input: s.iter().map(ToString::to_string).collect::<Vec<_>>().join("/"),
				reason: format!("expected {SEGMENT_COUNT} segments, got {}", s.len()),
			})?;

		if !matches!(segments[0], Segment::Literal(_)) {
			return Err(Error::InvalidPathExp {
				input: format!("/{}", segments.iter().map(ToString::to_string).collect::<Vec<_>>().join("/")),
				reason: "org must be a literal name".to_string(),
			});
		}
		Ok(Self { segments })
	}

	pub fn segments(&self) -> &[Segment; SEGMENT_COUNT] {
		&self.segments
	}

	pub fn org(&self) -> &str {
		match &self.segments[0] {
			Segment::Literal(org) => org,
			// from_segments rejects anything else
			_ => "",
		}
	}

	pub fn matches(&self, path: &ResourcePath) -> bool {
		self.segments
			.iter()
			.zip(path.segments.iter())
			.all(|(seg, value)| seg.matches(value))
	}

	pub fn overlaps(&self, other: &PathExp) -> bool {
		self.segments
			.iter()
			.zip(other.segments.iter())
			.all(|(a, b)| a.overlaps(b))
	}

	pub fn specificity(&self) -> Specificity {
		let wildcards = self.segments.iter().filter(|s| s.is_wildcard()).count() as u8;
		let mut weights = [0u8; SEGMENT_COUNT];
		for (w, seg) in weights.iter_mut().zip(self.segments.iter()) {
			*w = seg.weight();
		}
		Specificity {
			wildcards: Reverse(wildcards),
			weights,
		}
	}
}

impl fmt::Display for PathExp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for seg in &self.segments {
			write!(f, "/{seg}")?;
		}
		Ok(())
	}
}

impl FromStr for PathExp {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

impl Serialize for PathExp {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for PathExp {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::parse(&s).map_err(serde::de::Error::custom)
	}
}

impl From<&ResourcePath> for PathExp {
	fn from(path: &ResourcePath) -> Self {
		Self {
			segments: path.segments.clone().map(Segment::Literal),
		}
	}
}

// =============================================================================
// ResourcePath
// =============================================================================

/// A concrete six-segment path; every segment is a literal name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
	segments: [String; SEGMENT_COUNT],
}

impl ResourcePath {
	pub fn parse(input: &str) -> Result<Self> {
		let invalid = |reason: String| Error::InvalidPath {
			input: input.to_string(),
			reason,
		};

		let parts = split_segments(input).map_err(invalid)?;
		if let Some((raw, name)) = parts.iter().zip(SEGMENT_NAMES).find(|(raw, _)| !is_slug(raw)) {
			return Err(invalid(format!("{name}: {raw:?} is not a valid name")));
		}

		let segments: [String; SEGMENT_COUNT] = parts
			.try_into()
			.map_err(|_| invalid("wrong segment count".to_string()))?;
		Ok(Self { segments })
	}

	pub fn segments(&self) -> &[String; SEGMENT_COUNT] {
		&self.segments
	}

	pub fn org(&self) -> &str {
		&self.segments[0]
	}
}

impl fmt::Display for ResourcePath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for seg in &self.segments {
			write!(f, "/{seg}")?;
		}
		Ok(())
	}
}

impl FromStr for ResourcePath {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

impl Serialize for ResourcePath {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for ResourcePath {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::parse(&s).map_err(serde::de::Error::custom)
	}
}
