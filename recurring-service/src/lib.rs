//! Recurring Service - Projects recurring incomes and expenses and reconciles them against bank activity.

pub mod config;
pub mod matching;
pub mod models;
pub mod schedule;
pub mod services;
pub mod startup;
pub mod workers;
