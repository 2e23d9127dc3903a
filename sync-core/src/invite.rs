//! Single-use invitation tokens.
//!
//! Tokens are minted by an admin device and stored in the replicated
//! `invitations` collection. Redeeming a token produces the updated record;
//! a token that is unknown or already used is rejected without changes.

use sync_types::{DeviceId, Invitation, Role, Timestamp};

/// Minimum random bytes in an invitation token.
pub const MIN_TOKEN_BYTES: usize = 24;

/// Error type for invitation redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteError {
    /// No invitation with this token exists.
    Unknown,
    /// The invitation has already been redeemed.
    AlreadyUsed,
    /// The invitation is bound to another device.
    WrongDevice,
}

impl std::fmt::Display for InviteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InviteError::Unknown => write!(f, "unknown invitation token"),
            InviteError::AlreadyUsed => write!(f, "invitation token already used"),
            InviteError::WrongDevice => write!(f, "invitation token issued to another device"),
        }
    }
}

impl std::error::Error for InviteError {}

/// Build a fresh, unused invitation.
pub fn new_invitation(token: String, role: Role, now: Timestamp) -> Invitation {
    Invitation {
        token,
        role,
        created_at: now,
        used: false,
        used_by: None,
        used_at: None,
        issued_to: None,
    }
}

/// Redeem `token` against the stored invitation, if any.
///
/// Returns the record to write back. The input is never modified, so a
/// failed redemption leaves state untouched. A token bound to a device only
/// redeems for that device.
pub fn redeem(
    stored: Option<&Invitation>,
    token: &str,
    device: DeviceId,
    now: Timestamp,
) -> Result<Invitation, InviteError> {
    let invite = stored
        .filter(|i| i.token == token)
        .ok_or(InviteError::Unknown)?;
    if invite.used {
        return Err(InviteError::AlreadyUsed);
    }
    if invite.issued_to.is_some_and(|to| to != device) {
        return Err(InviteError::WrongDevice);
    }
    let mut redeemed = invite.clone();
    redeemed.used = true;
    redeemed.used_by = Some(device);
    redeemed.used_at = Some(now);
    Ok(redeemed)
}
