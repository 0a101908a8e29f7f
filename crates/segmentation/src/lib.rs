//! Audience segmentation: rule tree validation, audience resolution over
//! the customer repository, and persisted segment snapshots.

pub mod builder;
pub mod resolver;
pub mod rules;
pub mod segments;
pub mod validator;

pub use builder::RuleBuilder;
pub use resolver::{Audience, AudienceResolver, AudienceStats};
pub use rules::{RuleNode, ValidatedRuleTree, ValidationErrors};
pub use segments::{AudienceSummary, InMemorySegmentStore, Segment, SegmentService, SegmentStore};
pub use validator::validate;
