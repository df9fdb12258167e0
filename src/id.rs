use uuid::Uuid;

/// Time-ordered identifier used for every record the store creates itself.
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}
