#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod calibrate;
pub mod config;
pub mod data;
pub mod enumerate;
pub mod grouping;
pub mod labels;
pub mod model;
pub mod optimizer;
pub mod polarity;
pub mod session;
pub mod task;
pub mod trainer;
