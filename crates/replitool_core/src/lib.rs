pub mod archive;
pub mod boxcom;
pub mod checksum;
pub mod config;
pub mod csv_markdown;
pub mod dataverse;
pub mod http;
pub mod jira;
pub mod manifest;
pub mod notebook;
pub mod openicpsr;
pub mod progress;
pub mod sivacor;
pub mod summary;
pub mod template;
pub mod vcs;
pub mod worldbank;
pub mod zenodo;
