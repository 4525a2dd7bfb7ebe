pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PackagerConfig;
pub use types::{
    AccountInfo,
    FieldDef,
    FieldType,
    Request,
    SchemaKey,
    SurveyTableSet,
    TableId,
    TableMapping,
    UploadSchema,
};
