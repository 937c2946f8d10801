//! Merging the remote note list of an entity into the local one

use std::collections::HashSet;

use crate::notes::Note;
use crate::notes::NoteId;
use crate::notes::sort_notes;

/// Merge a remote note list with a local note list
///
/// - Every remote note is kept, a remote note replaces a local note with the same ID
/// - Local notes with a local-origin ID that the remote does not know are appended
/// - Local notes with a remote ID that the remote no longer has are dropped, they were deleted
///   on another device
///
/// The result is sorted by creation time. Merging the same remote list twice gives the same list.
pub fn merge(remote: &[Note], local: &[Note]) -> Vec<Note> {
    let mut seen: HashSet<&NoteId> = HashSet::with_capacity(remote.len());
    let mut merged = Vec::with_capacity(remote.len() + local.len());

    for note in remote {
        if seen.insert(&note.id) {
            merged.push(note.clone());
        }
    }

    for note in local {
        if note.id.is_local() && seen.insert(&note.id) {
            merged.push(note.clone());
        }
    }

    sort_notes(&mut merged);

    merged
}

/// Replace a local placeholder with its remote-confirmed version
///
/// Returns `false` when the placeholder is gone, it was deleted while syncing. When the
/// confirmed version is already present (a reconciliation merged it in) the placeholder is
/// just dropped.
pub fn replace_placeholder(notes: &mut Vec<Note>, local_id: &NoteId, confirmed: Note) -> bool {
    let Some(position) = notes.iter().position(|note| &note.id == local_id) else {
        return false;
    };

    if notes.iter().any(|note| note.id == confirmed.id) {
        notes.remove(position);
    } else {
        notes[position] = confirmed;
    }

    sort_notes(notes);

    true
}
