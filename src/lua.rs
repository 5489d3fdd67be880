// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub add_job: Script,
    pub drain_list: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        let add_job = Script::new(include_str!("./lua/add_job.lua"));
        let drain_list = Script::new(include_str!("./lua/drain_list.lua"));

        Self {
            add_job,
            drain_list,
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
