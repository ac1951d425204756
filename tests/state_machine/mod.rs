mod execution_state_machine;
mod persistence;
mod task_state_machine;
