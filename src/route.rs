//! Route identities used for bucket accounting.
//!
//! A [`BaseRoute`] is a method plus an endpoint template; a [`FormattedRoute`]
//! binds the template's major parameters. The platform buckets requests by
//! base route and major parameters only, so two requests that differ in any
//! other path value share a bucket.

use http::Method;
use std::fmt;

/// An HTTP method plus an endpoint template with placeholders, e.g.
/// `GET /channels/{channel}/messages`.
///
/// This is the identity the server assigns rate-limit bucket hashes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseRoute {
    method: Method,
    template: String,
}

impl BaseRoute {
    /// Create a base route from a method and an endpoint template.
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self { method, template: template.into() }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether this route creates a reaction.
    ///
    /// Reaction creation is limited aggressively by the platform, so waits on
    /// it are routine and logged at debug rather than info.
    pub fn is_create_reaction(&self) -> bool {
        self.method == Method::PUT && self.template.ends_with("/reactions/{emoji}/@me")
    }
}

impl fmt::Display for BaseRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// The three path parameters that participate in bucket identity.
///
/// All other path values are deliberately excluded: the platform documents
/// guild, channel, and webhook ids as the only bucket discriminators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MajorParams {
    guild_id: Option<u64>,
    channel_id: Option<u64>,
    webhook_id: Option<u64>,
}

impl MajorParams {
    /// No major parameters bound (e.g. `GET /gateway`).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn guild(id: u64) -> Self {
        Self { guild_id: Some(id), ..Self::default() }
    }

    pub fn channel(id: u64) -> Self {
        Self { channel_id: Some(id), ..Self::default() }
    }

    pub fn webhook(id: u64) -> Self {
        Self { webhook_id: Some(id), ..Self::default() }
    }

    pub fn guild_id(&self) -> Option<u64> {
        self.guild_id
    }

    pub fn channel_id(&self) -> Option<u64> {
        self.channel_id
    }

    pub fn webhook_id(&self) -> Option<u64> {
        self.webhook_id
    }
}

impl fmt::Display for MajorParams {
    /// Renders the ordered triple as `guild:channel:webhook` with empty
    /// segments for unbound parameters, the form used inside bucket keys.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seg(f: &mut fmt::Formatter<'_>, v: Option<u64>) -> fmt::Result {
            match v {
                Some(id) => write!(f, "{id}"),
                None => Ok(()),
            }
        }

        seg(f, self.guild_id)?;
        f.write_str(":")?;
        seg(f, self.channel_id)?;
        f.write_str(":")?;
        seg(f, self.webhook_id)
    }
}

/// A base route with its major parameters bound: the unit requests are
/// submitted under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormattedRoute {
    base: BaseRoute,
    major: MajorParams,
}

impl FormattedRoute {
    pub fn new(base: BaseRoute, major: MajorParams) -> Self {
        Self { base, major }
    }

    pub fn base(&self) -> &BaseRoute {
        &self.base
    }

    pub fn major_params(&self) -> MajorParams {
        self.major
    }

    /// The key identifying this route's bucket under `hash`.
    ///
    /// Real hashes and synthetic `unlimited+…` hashes produce disjoint key
    /// spaces, so a provisional bucket can never collide with a learned one.
    pub(crate) fn bucket_key(&self, hash: &str) -> String {
        format!("{hash}:{}", self.major)
    }

    /// The synthetic hash used before the server has revealed the real one.
    pub(crate) fn synthetic_hash(&self) -> String {
        format!("unlimited+{self}")
    }
}

impl fmt::Display for FormattedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.base.method, self.base.template, self.major)
    }
}
