use crate::errors::ConfigError;
use regex::Regex;
use std::{fmt, str::FromStr};

static LATEST_STR: &str = "latest";

/// An image name with an optional tag, like `alpine` or `busybox:1.35`
///
/// Names are lowercase alphanumeric words joined by single dots, dashes, or
/// underscores. Tags are up to 128 characters long, including alphanumeric
/// characters and underscores anywhere in the string, and dots or dashes
/// anywhere except the beginning. A missing tag means `latest`.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ImageReference {
    name: String,
    tag: String,
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        lazy_static! {
            static ref RE: Regex = Regex::new(&format!(
                "^{}(?::{})?$",
                ImageReference::name_regex_str(),
                ImageReference::tag_regex_str()
            ))
            .unwrap();
        }
        let captures = RE
            .captures(s)
            .ok_or_else(|| ConfigError::InvalidReferenceFormat(s.to_owned()))?;
        let name = captures.name("name").map(|m| m.as_str()).unwrap_or_default();
        let tag = captures.name("tag").map(|m| m.as_str()).unwrap_or(LATEST_STR);
        ImageReference::from_parts(name, tag)
    }

    pub fn from_parts(name: &str, tag: &str) -> Result<Self, ConfigError> {
        lazy_static! {
            static ref NAME: Regex =
                Regex::new(&format!("^{}$", ImageReference::name_regex_str())).unwrap();
            static ref TAG: Regex =
                Regex::new(&format!("^{}$", ImageReference::tag_regex_str())).unwrap();
        }
        if NAME.is_match(name) && TAG.is_match(tag) {
            Ok(ImageReference {
                name: name.to_owned(),
                tag: tag.to_owned(),
            })
        } else {
            Err(ConfigError::InvalidReferenceFormat(format!("{}:{}", name, tag)))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_latest(&self) -> bool {
        self.tag == LATEST_STR
    }

    fn name_regex_str() -> &'static str {
        "(?P<name>[a-z0-9]+(?:[._-][a-z0-9]+)*)"
    }

    fn tag_regex_str() -> &'static str {
        "(?P<tag>[a-zA-Z0-9_][a-zA-Z0-9_.-]{0,127})"
    }
}

impl FromStr for ImageReference {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageReference::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl fmt::Debug for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_references() {
        let alpine: ImageReference = "alpine".parse().unwrap();
        assert_eq!(alpine.name(), "alpine");
        assert_eq!(alpine.tag(), "latest");
        assert!(alpine.is_latest());
        assert_eq!(alpine.to_string(), "alpine:latest");

        let busybox = ImageReference::parse("busybox:1.35.0").unwrap();
        assert_eq!(busybox.name(), "busybox");
        assert_eq!(busybox.tag(), "1.35.0");
        assert!(!busybox.is_latest());

        assert!(ImageReference::parse("my-app_2.x").is_ok());
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Alpine").is_err());
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("alpine:.hidden").is_err());
        assert!(ImageReference::parse("../etc").is_err());
        assert!(ImageReference::parse("a/b").is_err());
        assert!(ImageReference::parse("-alpine").is_err());
        assert!(ImageReference::parse("alpine:1:2").is_err());
    }
}
