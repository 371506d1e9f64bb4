use bytes::Bytes;
use glob_match::glob_match;
use itertools::Itertools;
use std::str;
use tracing::warn;

use crate::commands::executable::{Context, Executable};
use crate::commands::CommandParser;
use crate::frame::{Response, MAX_FIELDS};
use crate::Error;

// Stands in for `/` while matching, so wildcards are not stopped at path separators.
const SEPARATOR: &str = "\u{1f}";

/// Lists the stored keys matching a glob pattern, in byte order. `*` and `?` match any character
/// including `/`. Keys that are not valid UTF-8 never match.
#[derive(Debug, PartialEq)]
pub struct DataKeys {
    pub pattern: String,
}

impl Executable for DataKeys {
    fn exec(self, ctx: &mut Context<'_>) -> Result<Response, Error> {
        let tables = ctx.manager.lock();

        if ctx.current_user(&tables).is_none() {
            return Ok(Response::Failure);
        }

        let pattern = self.pattern.replace('/', SEPARATOR);
        let keys: Vec<Bytes> = tables
            .data
            .keys()
            .filter(|key| {
                str::from_utf8(key)
                    .map(|key| glob_match(&pattern, &key.replace('/', SEPARATOR)))
                    .unwrap_or(false)
            })
            .cloned()
            .sorted()
            .collect();

        if keys.len() > MAX_FIELDS {
            warn!(matched = keys.len(), "Too many keys match {:?}", self.pattern);
            return Ok(Response::Failure);
        }

        Ok(Response::Fields(keys))
    }
}

impl TryFrom<&mut CommandParser<'_>> for DataKeys {
    type Error = Error;

    fn try_from(parser: &mut CommandParser<'_>) -> Result<Self, Self::Error> {
        let pattern = parser.next_string()?;

        Ok(Self { pattern })
    }
}
