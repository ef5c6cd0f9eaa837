// Source feed adapters.

pub mod alphavantage;
