pub mod config;
pub mod logging;

pub mod geometry;
pub mod cloud;
pub mod skeleton;

pub mod registry;
pub mod intake;
pub mod control;

pub mod triangulation;
pub mod matcher;
pub mod tracker;
pub mod pipeline;

pub mod cycle;
pub mod recording;
pub mod receiver;
pub mod protocol;
