mod helper;
mod notes;
