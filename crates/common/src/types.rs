use std::collections::BTreeMap;

use chrono::NaiveDate;
use errors::ErrorMetadata;

/// Opaque identifier for a table on the remote table service.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TableId(pub String);

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TableId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A validated package request: a study, a user, and an inclusive date range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub study_id: String,
    pub user_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Request {
    pub fn new(
        study_id: impl Into<String>,
        user_id: impl Into<String>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<Self> {
        let study_id = study_id.into();
        let user_id = user_id.into();
        if study_id.is_empty() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingStudyId",
                "studyId must not be empty",
            ));
        }
        if user_id.is_empty() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingUserId",
                "userId must not be empty",
            ));
        }
        if start_date > end_date {
            anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidDateRange",
                format!("startDate {start_date} is after endDate {end_date}"),
            ));
        }
        Ok(Self {
            study_id,
            user_id,
            start_date,
            end_date,
        })
    }
}

/// Account lookup is an external collaborator (see spec §1), but the shape of
/// what it returns is part of our contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    email_address: String,
    user_id: String,
    health_code: Option<String>,
}

impl AccountInfo {
    pub fn new(
        email_address: impl Into<String>,
        user_id: impl Into<String>,
        health_code: Option<String>,
    ) -> anyhow::Result<Self> {
        let email_address = email_address.into();
        let user_id = user_id.into();
        if email_address.is_empty() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingEmail",
                "emailAddress must not be empty",
            ));
        }
        if user_id.is_empty() {
            anyhow::bail!(ErrorMetadata::bad_request(
                "MissingUserId",
                "userId must not be empty",
            ));
        }
        Ok(Self {
            email_address,
            user_id,
            health_code,
        })
    }

    pub fn email_address(&self) -> &str {
        &self.email_address
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn health_code(&self) -> Option<&str> {
        self.health_code.as_deref()
    }
}

/// Closed enumeration of field types a schema can declare. `Attachment`
/// cells hold remote file-handle ids; everything else is a scalar CSV cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Int,
    Float,
    Boolean,
    Date,
    Json,
    Attachment,
}

impl FieldType {
    pub fn is_attachment(self) -> bool {
        matches!(self, FieldType::Attachment)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// Identifier for an `UploadSchema`: a study, a schema id, and a revision
/// number. The same remote table id may back multiple schemas; see
/// [`TableMapping`] for how ties are broken.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaKey {
    pub study_id: String,
    pub schema_id: String,
    pub revision: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadSchema {
    pub key: SchemaKey,
    pub fields: Vec<FieldDef>,
}

impl UploadSchema {
    pub fn new(key: SchemaKey, fields: Vec<FieldDef>) -> Self {
        Self { key, fields }
    }

    pub fn has_attachment_fields(&self) -> bool {
        self.fields.iter().any(|f| f.field_type.is_attachment())
    }

    /// Column names whose cells hold file-handle ids, in schema order.
    pub fn attachment_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.field_type.is_attachment())
            .map(|f| f.name.as_str())
            .collect()
    }
}

/// A mapping from remote table id to the schema it represents. Insertion is
/// last-revision-wins: if two schemas claim the same table id, the one with
/// the higher `revision` is kept (spec §3).
#[derive(Clone, Debug, Default)]
pub struct TableMapping(BTreeMap<TableId, UploadSchema>);

impl TableMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table_id: TableId, schema: UploadSchema) {
        match self.0.get(&table_id) {
            Some(existing) if existing.key.revision >= schema.key.revision => {},
            _ => {
                self.0.insert(table_id, schema);
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TableId, &UploadSchema)> {
        self.0.iter()
    }
}

impl FromIterator<(TableId, UploadSchema)> for TableMapping {
    fn from_iter<T: IntoIterator<Item = (TableId, UploadSchema)>>(iter: T) -> Self {
        let mut mapping = Self::new();
        for (table_id, schema) in iter {
            mapping.insert(table_id, schema);
        }
        mapping
    }
}

/// The set of remote table ids carrying survey metadata for a study.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SurveyTableSet(Vec<TableId>);

impl SurveyTableSet {
    pub fn new(ids: Vec<TableId>) -> Self {
        Self(ids)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableId> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(revision: u32) -> UploadSchema {
        UploadSchema::new(
            SchemaKey {
                study_id: "study".to_string(),
                schema_id: "schema".to_string(),
                revision,
            },
            vec![],
        )
    }

    #[test]
    fn request_rejects_reversed_range() {
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = Request::new("study", "user", start, end).unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_bad_request(&err));
    }

    #[test]
    fn request_rejects_empty_fields() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(Request::new("", "user", d, d).is_err());
        assert!(Request::new("study", "", d, d).is_err());
    }

    #[test]
    fn table_mapping_keeps_latest_revision_on_conflict() {
        let mut mapping = TableMapping::new();
        let id = TableId::from("t1");
        mapping.insert(id.clone(), schema(1));
        mapping.insert(id.clone(), schema(3));
        mapping.insert(id.clone(), schema(2));
        assert_eq!(mapping.len(), 1);
        let (_, kept) = mapping.iter().next().unwrap();
        assert_eq!(kept.key.revision, 3);
    }

    #[test]
    fn attachment_field_names_filters_by_type() {
        let schema = UploadSchema::new(
            SchemaKey {
                study_id: "s".into(),
                schema_id: "sc".into(),
                revision: 1,
            },
            vec![
                FieldDef {
                    name: "photo".into(),
                    field_type: FieldType::Attachment,
                },
                FieldDef {
                    name: "weight".into(),
                    field_type: FieldType::Float,
                },
            ],
        );
        assert_eq!(schema.attachment_field_names(), vec!["photo"]);
        assert!(schema.has_attachment_fields());
    }
}
