pub mod level_indicate;
pub mod modem;
pub mod orchestrate;
pub mod power;
pub mod publish_periodic;
pub mod requests;
pub mod sample;
pub mod settings_storage;
pub mod track_inactivity;
