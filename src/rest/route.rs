//! Route templates
//!
//! A [`Route`] is an HTTP method plus a path template such as
//! `/channels/{channel_id}/messages`. The first `{param}` is the major
//! parameter: requests that differ only in it never share a rate-limit bucket.

use crate::error::RestError;
use reqwest::Method;
use std::fmt;

/// Bucket hash placeholder for routes without a major parameter
pub const NO_MAJOR_PARAM: &str = "-";

/// Method plus path template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    template: &'static str,
}

impl Route {
    pub const fn new(method: Method, template: &'static str) -> Self {
        Self { method, template }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &'static str {
        self.template
    }

    /// Name of the first `{param}` in the template
    pub fn major_param(&self) -> Option<&'static str> {
        let start = self.template.find('{')?;
        let end = self.template[start..].find('}')? + start;
        Some(&self.template[start + 1..end])
    }

    /// Fill the template. Every `{param}` must be supplied.
    pub fn compile(&self, params: &[(&str, &str)]) -> Result<CompiledRoute, RestError> {
        let mut path = String::with_capacity(self.template.len() + 32);
        let mut major = None;
        let mut rest = self.template;

        while let Some(start) = rest.find('{') {
            path.push_str(&rest[..start]);
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let name = &rest[start + 1..start + len];
            let value = params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
                .ok_or_else(|| RestError::MissingParam {
                    template: self.template,
                    param: name.to_string(),
                })?;

            if major.is_none() {
                major = Some(value.to_string());
            }
            path.push_str(value);
            rest = &rest[start + len + 1..];
        }
        path.push_str(rest);

        Ok(CompiledRoute {
            route: self.clone(),
            path,
            major: major.unwrap_or_else(|| NO_MAJOR_PARAM.to_string()),
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// A route with its parameters filled in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledRoute {
    route: Route,
    path: String,
    major: String,
}

impl CompiledRoute {
    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn method(&self) -> &Method {
        &self.route.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value of the major parameter, or `-`
    pub fn major(&self) -> &str {
        &self.major
    }

    /// Bucket key once the server has told us the route's hash
    pub fn bucket_key(&self, hash: &str) -> String {
        format!("{hash};{}", self.major)
    }

    /// Bucket key before the first response for this route arrives
    pub fn provisional_key(&self) -> String {
        format!("UNKNOWN;{} {};{}", self.route.method, self.route.template, self.major)
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.route.method, self.path)
    }
}

pub const GET_GATEWAY: Route = Route::new(Method::GET, "/gateway");
pub const GET_GATEWAY_BOT: Route = Route::new(Method::GET, "/gateway/bot");

pub const GET_CHANNEL: Route = Route::new(Method::GET, "/channels/{channel_id}");
pub const PATCH_CHANNEL: Route = Route::new(Method::PATCH, "/channels/{channel_id}");
pub const DELETE_CHANNEL: Route = Route::new(Method::DELETE, "/channels/{channel_id}");
pub const GET_CHANNEL_MESSAGES: Route = Route::new(Method::GET, "/channels/{channel_id}/messages");
pub const POST_CHANNEL_MESSAGES: Route = Route::new(Method::POST, "/channels/{channel_id}/messages");
pub const GET_CHANNEL_MESSAGE: Route =
    Route::new(Method::GET, "/channels/{channel_id}/messages/{message_id}");
pub const PATCH_CHANNEL_MESSAGE: Route =
    Route::new(Method::PATCH, "/channels/{channel_id}/messages/{message_id}");
pub const DELETE_CHANNEL_MESSAGE: Route =
    Route::new(Method::DELETE, "/channels/{channel_id}/messages/{message_id}");
pub const PUT_MY_REACTION: Route = Route::new(
    Method::PUT,
    "/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me",
);
pub const POST_CHANNEL_TYPING: Route = Route::new(Method::POST, "/channels/{channel_id}/typing");

pub const GET_GUILD: Route = Route::new(Method::GET, "/guilds/{guild_id}");
pub const GET_GUILD_CHANNELS: Route = Route::new(Method::GET, "/guilds/{guild_id}/channels");
pub const GET_GUILD_MEMBER: Route = Route::new(Method::GET, "/guilds/{guild_id}/members/{user_id}");
pub const PATCH_GUILD_MEMBER: Route = Route::new(Method::PATCH, "/guilds/{guild_id}/members/{user_id}");
pub const PUT_GUILD_MEMBER_ROLE: Route =
    Route::new(Method::PUT, "/guilds/{guild_id}/members/{user_id}/roles/{role_id}");
pub const DELETE_GUILD_MEMBER_ROLE: Route =
    Route::new(Method::DELETE, "/guilds/{guild_id}/members/{user_id}/roles/{role_id}");
pub const GET_GUILD_ROLES: Route = Route::new(Method::GET, "/guilds/{guild_id}/roles");

pub const GET_MY_USER: Route = Route::new(Method::GET, "/users/@me");
pub const POST_INTERACTION_CALLBACK: Route = Route::new(
    Method::POST,
    "/interactions/{interaction_id}/{interaction_token}/callback",
);
pub const POST_WEBHOOK: Route = Route::new(Method::POST, "/webhooks/{webhook_id}/{webhook_token}");
