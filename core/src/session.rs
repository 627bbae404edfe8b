/// Identifies one server-side connection in logs.
pub type ID = uuid::Uuid;

pub fn new_id() -> ID {
    ID::new_v4()
}
