pub mod import_controller;
pub mod import_repository;
pub mod import_session;
