use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Two visits clash when either one starts inside the other's window.
/// Checking both directions keeps the relation symmetric, so an approval
/// for an earlier slot can't land underneath a later-approved one.
fn windows_clash(candidate: Ms, existing: Ms) -> bool {
    Span::visit_window(existing).contains_instant(candidate)
        || Span::visit_window(candidate).contains_instant(existing)
}

/// The first approved visit that `candidate` clashes with.
pub fn find_conflict<'a>(candidate: &VisitTime, approved: &'a [VisitTime]) -> Option<&'a VisitTime> {
    let c = candidate.timestamp_millis();
    approved
        .iter()
        .find(|v| windows_clash(c, v.timestamp_millis()))
}

pub fn conflicts(candidate: &VisitTime, approved: &[VisitTime]) -> bool {
    find_conflict(candidate, approved).is_some()
}

/// Run the checker against a listing's approved slots and name the
/// clashing booking in the error.
pub(crate) fn check_no_conflict(
    approved: &[(Ulid, VisitTime)],
    candidate: &VisitTime,
) -> Result<(), EngineError> {
    let c = candidate.timestamp_millis();
    match approved
        .iter()
        .find(|(_, v)| windows_clash(c, v.timestamp_millis()))
    {
        Some((booking_id, visit_at)) => Err(EngineError::Conflict {
            booking_id: *booking_id,
            visit_at: *visit_at,
        }),
        None => Ok(()),
    }
}

pub(crate) fn validate_visit_time(t: &VisitTime) -> Result<(), EngineError> {
    use crate::limits::*;
    let ms = t.timestamp_millis();
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("visit time out of range"));
    }
    Ok(())
}
