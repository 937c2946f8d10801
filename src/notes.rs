//! Notes and the entities they are attached to

use core::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;
use crate::error::Result;

/// Prefix reserved for notes that are not yet confirmed by the remote store
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Kind of entity a note is attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    /// A phone call
    Call,

    /// An SMS conversation
    Sms,
}

impl EntityType {
    /// All known entity types
    pub const ALL: [EntityType; 2] = [EntityType::Call, EntityType::Sms];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Call => "call",
            EntityType::Sms => "sms",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "call" => Ok(EntityType::Call),
            "sms" => Ok(EntityType::Sms),
            other => Err(Error::Validation(format!("Unknown entity type: {other}"))),
        }
    }
}

/// Composite key of an entity, `entityType:entityId`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    /// Create a validated entity key
    pub fn new<I>(entity_type: EntityType, entity_id: I) -> Result<Self>
    where
        I: Into<String>,
    {
        let key = Self {
            entity_type,
            entity_id: entity_id.into(),
        };

        key.validate()?;

        Ok(key)
    }

    /// Check the entity ID can be used as part of a storage key
    pub fn validate(&self) -> Result<()> {
        if self.entity_id.trim().is_empty() {
            return Err(Error::Validation("Entity ID can not be empty".into()));
        }

        if self.entity_id.contains(':') {
            return Err(Error::Validation(r#"Entity ID can not contain ":""#.into()));
        }

        Ok(())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl FromStr for EntityKey {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (entity_type, entity_id) = value
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("Invalid entity key: {value}")))?;

        EntityKey::new(entity_type.parse()?, entity_id)
    }
}

/// Identifier of a note
///
/// Local-origin IDs carry [`LOCAL_ID_PREFIX`], everything else was issued by the remote store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    /// Mint a new local-origin ID
    ///
    /// The only way to create an ID with the reserved prefix
    pub fn local() -> Self {
        let random = Uuid::new_v4().simple().to_string();

        Self(format!(
            "{LOCAL_ID_PREFIX}{}_{}",
            Utc::now().timestamp_millis(),
            &random[..9]
        ))
    }

    /// Wrap an ID issued by the remote store
    ///
    /// Records read back from the store go through `remote::issued_id`, which refuses the
    /// local-origin prefix.
    pub fn remote<I>(id: I) -> Self
    where
        I: Into<String>,
    {
        Self(id.into())
    }

    /// Is this ID not yet confirmed by the remote store?
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Format of the note content
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentFormat {
    #[default]
    Plain,
    Html,
    Markdown,
}

impl ContentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentFormat::Plain => "plain",
            ContentFormat::Html => "html",
            ContentFormat::Markdown => "markdown",
        }
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "plain" => Ok(ContentFormat::Plain),
            "html" => Ok(ContentFormat::Html),
            "markdown" => Ok(ContentFormat::Markdown),
            other => Err(Error::Validation(format!("Unknown content format: {other}"))),
        }
    }
}

/// The user doing something with a note
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Author {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("Author ID can not be empty".into()));
        }

        Ok(())
    }
}

/// A note attached to a call or SMS conversation
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub reference_id: String,
    pub reference_type: EntityType,
    pub content: String,
    pub content_format: ContentFormat,
    pub created_by: String,
    pub created_by_name: Option<String>,
    pub created_by_email: Option<String>,
    pub last_edited_by: Option<String>,
    pub last_edited_by_name: Option<String>,
    pub last_edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    /// Create a note that only exists locally
    pub fn provisional(values: &CreateNoteValues) -> Self {
        let now = Utc::now();

        Self {
            id: NoteId::local(),
            reference_id: values.entity.entity_id.clone(),
            reference_type: values.entity.entity_type,
            content: values.content.clone(),
            content_format: values.content_format,
            created_by: values.author.id.clone(),
            created_by_name: values.author.name.clone(),
            created_by_email: values.author.email.clone(),
            last_edited_by: None,
            last_edited_by_name: None,
            last_edited_at: None,
            is_edited: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The entity this note belongs to
    pub fn entity(&self) -> EntityKey {
        EntityKey {
            entity_type: self.reference_type,
            entity_id: self.reference_id.clone(),
        }
    }

    /// Apply an edit, bumping the edit attribution
    pub fn apply(&mut self, patch: &NotePatch) {
        self.content.clone_from(&patch.content);
        self.content_format = patch.content_format;
        self.last_edited_by = Some(patch.editor.id.clone());
        self.last_edited_by_name.clone_from(&patch.editor.name);
        self.last_edited_at = Some(patch.edited_at);
        self.is_edited = true;
        self.updated_at = patch.edited_at;
    }

    /// The values the remote store needs to create this note
    pub fn to_new_note(&self) -> NewNote {
        NewNote {
            reference_id: self.reference_id.clone(),
            reference_type: self.reference_type,
            content: self.content.clone(),
            content_format: self.content_format,
            created_by: self.created_by.clone(),
            created_by_name: self.created_by_name.clone(),
            created_by_email: self.created_by_email.clone(),
            last_edited_by: self.last_edited_by.clone(),
            last_edited_by_name: self.last_edited_by_name.clone(),
            last_edited_at: self.last_edited_at,
            is_edited: self.is_edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Sort notes ascending by creation time
///
/// Ties are broken by ID so the order is the same on every device
pub fn sort_notes(notes: &mut [Note]) {
    notes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// A note as sent to the remote store, the remote store issues the ID
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    pub reference_id: String,
    pub reference_type: EntityType,
    pub content: String,
    pub content_format: ContentFormat,
    pub created_by: String,
    pub created_by_name: Option<String>,
    pub created_by_email: Option<String>,
    pub last_edited_by: Option<String>,
    pub last_edited_by_name: Option<String>,
    pub last_edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NewNote {
    /// Turn into a note with the ID the remote store issued
    pub fn into_note(self, id: NoteId) -> Note {
        Note {
            id,
            reference_id: self.reference_id,
            reference_type: self.reference_type,
            content: self.content,
            content_format: self.content_format,
            created_by: self.created_by,
            created_by_name: self.created_by_name,
            created_by_email: self.created_by_email,
            last_edited_by: self.last_edited_by,
            last_edited_by_name: self.last_edited_by_name,
            last_edited_at: self.last_edited_at,
            is_edited: self.is_edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// An edit of a note, as applied locally and remotely
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotePatch {
    pub content: String,
    pub content_format: ContentFormat,
    pub editor: Author,
    pub edited_at: DateTime<Utc>,
}

/// Values to create a note
#[derive(Clone, Debug)]
pub struct CreateNoteValues {
    /// Entity to attach the note to
    pub entity: EntityKey,

    /// Content of the note
    pub content: String,

    /// Format of the content
    pub content_format: ContentFormat,

    /// User creating the note
    pub author: Author,
}

impl CreateNoteValues {
    pub fn validate(&self) -> Result<()> {
        self.entity.validate()?;
        validate_content(&self.content)?;
        self.author.validate()
    }
}

/// Values to update a note
#[derive(Clone, Debug)]
pub struct UpdateNoteValues {
    /// New content of the note
    pub content: String,

    /// New format of the content
    pub content_format: ContentFormat,

    /// User editing the note
    pub editor: Author,
}

impl UpdateNoteValues {
    pub fn validate(&self) -> Result<()> {
        validate_content(&self.content)?;
        self.editor.validate()
    }

    /// Stamp the edit with the current time
    pub fn to_patch(&self) -> NotePatch {
        NotePatch {
            content: self.content.clone(),
            content_format: self.content_format,
            editor: self.editor.clone(),
            edited_at: Utc::now(),
        }
    }
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::Validation("Content can not be empty".into()));
    }

    Ok(())
}

/// Check a note ID supplied by a caller
pub fn validate_note_id(id: &NoteId) -> Result<()> {
    if id.as_str().trim().is_empty() {
        return Err(Error::Validation("Note ID can not be empty".into()));
    }

    Ok(())
}
