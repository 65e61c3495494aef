#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use ats_common::constants;
pub use ats_env::*;
pub use ats_sim::{AddressBook, Event, InfoEvent, Violation};
pub use ats_solver::*;
