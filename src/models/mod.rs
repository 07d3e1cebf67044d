pub mod task;
pub mod user;

pub use task::{Assignment, FieldUpdate, NewTask, Task, TaskDetails, TaskInput, TaskPatch};
pub use user::{Role, User, UserInput, UserRecord};
