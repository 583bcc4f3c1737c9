use super::error::ApiError;

/// Roles the external session layer can resolve a caller to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Administrator,
    Viewer,
}

/// Already-authenticated caller identity. The JWT/session machinery lives
/// outside the core; it hands us these two headers.
#[derive(Debug, Clone)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

pub const ACTOR_HEADER: &str = "x-admin-actor";
pub const ROLE_HEADER: &str = "x-admin-role";

pub fn resolve_actor(headers: &[(String, String)]) -> Result<Actor, ApiError> {
    let name = header_value(headers, ACTOR_HEADER)
        .ok_or_else(|| ApiError::unauthorized("missing administrator session"))?;
    let role_text = header_value(headers, ROLE_HEADER)
        .ok_or_else(|| ApiError::unauthorized("missing administrator session"))?;
    let role = match role_text.to_ascii_lowercase().as_str() {
        "administrator" => Role::Administrator,
        "viewer" => Role::Viewer,
        other => {
            return Err(ApiError::unauthorized(format!(
                "unknown role '{other}' in session"
            )));
        }
    };
    Ok(Actor {
        name: name.to_string(),
        role,
    })
}

impl Actor {
    /// Writes require the administrator role; viewers read only.
    pub fn require_administrator(&self) -> Result<(), ApiError> {
        match self.role {
            Role::Administrator => Ok(()),
            Role::Viewer => Err(ApiError::forbidden("administrator role required")),
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header == name)
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
}
