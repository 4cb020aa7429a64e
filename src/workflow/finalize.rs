//! Referral trailer appended to every outgoing message.

/// Append the referral trailer for `coach_id`.
pub fn finalize(message: &str, trailer_url: &str, coach_id: &str) -> String {
    format!("{message}\nPowered by MyAgentsAI: {trailer_url}?ref={coach_id}")
}
