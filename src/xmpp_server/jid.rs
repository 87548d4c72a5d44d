//! XMPP addresses: `node@domain/resource`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length of each address part (RFC 7622 §3).
const MAX_PART_LEN: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("empty domain")]
    EmptyDomain,
    #[error("empty localpart")]
    EmptyNode,
    #[error("empty resource")]
    EmptyResource,
    #[error("{0} part is too long")]
    TooLong(&'static str),
    #[error("forbidden character {0:?} in {1}")]
    ForbiddenChar(char, &'static str),
}

/// A bare (`node@domain`, `domain`) or full (`node@domain/resource`) address.
///
/// Domain and node are case-folded on construction so that two addresses that
/// differ only by case compare equal. Resources are kept as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Result<Self, JidError> {
        let domain = domain.trim_end_matches('.').to_lowercase();
        validate_domain(&domain)?;

        let node = match node {
            Some(n) => {
                let n = n.to_lowercase();
                validate_node(&n)?;
                Some(n)
            }
            None => None,
        };

        let resource = match resource {
            Some(r) => {
                validate_resource(r)?;
                Some(r.to_string())
            }
            None => None,
        };

        Ok(Self {
            node,
            domain,
            resource,
        })
    }

    /// A domain-only address.
    pub fn domain_jid(domain: &str) -> Result<Self, JidError> {
        Self::new(None, domain, None)
    }

    pub fn parse(s: &str) -> Result<Self, JidError> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) => (rest, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, rest),
        };
        Self::new(node, domain, resource)
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// Address without its resource.
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        validate_resource(resource)?;
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        })
    }

    /// Whether this address is `domain` itself or one of its subdomains.
    pub fn is_within(&self, domain: &str) -> bool {
        self.domain == domain || self.domain.ends_with(&format!(".{}", domain))
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_domain(domain: &str) -> Result<(), JidError> {
    if domain.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    if domain.len() > MAX_PART_LEN {
        return Err(JidError::TooLong("domain"));
    }
    if let Some(c) = domain
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '@' | '/' | '<' | '>' | '"' | '\'' | '&'))
    {
        return Err(JidError::ForbiddenChar(c, "domain"));
    }
    Ok(())
}

fn validate_node(node: &str) -> Result<(), JidError> {
    if node.is_empty() {
        return Err(JidError::EmptyNode);
    }
    if node.len() > MAX_PART_LEN {
        return Err(JidError::TooLong("localpart"));
    }
    if let Some(c) = node.chars().find(|c| {
        c.is_whitespace() || c.is_control() || matches!(c, '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@')
    }) {
        return Err(JidError::ForbiddenChar(c, "localpart"));
    }
    Ok(())
}

fn validate_resource(resource: &str) -> Result<(), JidError> {
    if resource.is_empty() {
        return Err(JidError::EmptyResource);
    }
    if resource.len() > MAX_PART_LEN {
        return Err(JidError::TooLong("resource"));
    }
    if let Some(c) = resource.chars().find(|c| c.is_control()) {
        return Err(JidError::ForbiddenChar(c, "resource"));
    }
    Ok(())
}
