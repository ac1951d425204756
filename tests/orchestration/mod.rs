mod budget_enforcement;
mod lifecycle;
mod recovery;
mod scenarios;
