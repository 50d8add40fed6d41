// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub enqueue: Script,
    pub acquire_lease: Script,
    pub release_lease: Script,
    pub mark_for_deletion: Script,
    pub remove_marked: Script,
    pub set_locks: Script,
    pub cleanup_queue: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(include_str!("./lua/enqueue.lua")),
            acquire_lease: Script::new(include_str!("./lua/acquire_lease.lua")),
            release_lease: Script::new(include_str!("./lua/release_lease.lua")),
            mark_for_deletion: Script::new(include_str!("./lua/mark_for_deletion.lua")),
            remove_marked: Script::new(include_str!("./lua/remove_marked.lua")),
            set_locks: Script::new(include_str!("./lua/set_locks.lua")),
            cleanup_queue: Script::new(include_str!("./lua/cleanup_queue.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
