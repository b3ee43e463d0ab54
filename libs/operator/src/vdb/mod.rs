pub mod annotations;
pub mod controller;
pub mod crd;
pub mod names;
pub mod reconcile;
