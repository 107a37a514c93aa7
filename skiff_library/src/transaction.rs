use guid_create::GUID;

pub type TransactionId = String;

pub fn gen_tid() -> TransactionId {
    GUID::rand().to_string().to_lowercase().replace('-', "")
}

/// Use the caller-supplied transaction id, or make a fresh one if it is blank
pub fn tid_or_new(tid: String) -> TransactionId {
    match tid.is_empty() {
        true => gen_tid(),
        false => tid,
    }
}

lazy_static::lazy_static! {
  pub static ref STARTUP_TID: TransactionId = "Startup".to_string();
  pub static ref TEST_TID: TransactionId = "TestTest".to_string();
  pub static ref JANITOR_TID: TransactionId = "Janitor".to_string();
  pub static ref CLEAN_TID: TransactionId = "Clean".to_string();
}
