//! Event types every host knows about before any plugin loads.
//!
//! Ids are fixed so that log parsers and plugins can use the constants
//! directly. Custom event types never take one of these ids.

use warden_types::EventTypeId;

/// A pre-declared event type.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinEvent {
    pub id: EventTypeId,
    pub key: &'static str,
    pub label: &'static str,
}

macro_rules! builtin_events {
    ($($id:literal => $key:ident, $label:literal;)*) => {
        $(
            #[doc = $label]
            pub const $key: EventTypeId = EventTypeId($id);
        )*

        /// All built-in event types, in id order.
        pub const BUILTIN_EVENTS: &[BuiltinEvent] = &[
            $(BuiltinEvent { id: EventTypeId($id), key: stringify!($key), label: $label },)*
        ];
    };
}

builtin_events! {
    1 => EXIT, "Program Exit";
    2 => STOP, "Stop Process";
    3 => UNKNOWN, "Unknown Event";
    4 => CUSTOM, "Custom Event";
    5 => PLUGIN_ENABLED, "Plugin Enabled";
    6 => PLUGIN_DISABLED, "Plugin Disabled";
    7 => PLUGIN_LOADED, "Plugin Loaded";
    8 => PLUGIN_UNLOADED, "Plugin Unloaded";
    9 => CLIENT_SAY, "Say";
    10 => CLIENT_TEAM_SAY, "Team Say";
    11 => CLIENT_SQUAD_SAY, "Squad Say";
    12 => CLIENT_PRIVATE_SAY, "Private Message";
    13 => CLIENT_CONNECT, "Client Connect";
    14 => CLIENT_AUTH, "Client Authenticated";
    15 => CLIENT_DISCONNECT, "Client Disconnect";
    16 => CLIENT_UPDATE, "Client Update";
    17 => CLIENT_KILL, "Client Kill";
    18 => CLIENT_GIB, "Client Gib";
    19 => CLIENT_GIB_TEAM, "Client Gib Team";
    20 => CLIENT_GIB_SELF, "Client Gib Self";
    21 => CLIENT_SUICIDE, "Client Suicide";
    22 => CLIENT_KILL_TEAM, "Client Team Kill";
    23 => CLIENT_DAMAGE, "Client Damage";
    24 => CLIENT_DAMAGE_SELF, "Client Damage Self";
    25 => CLIENT_DAMAGE_TEAM, "Client Team Damage";
    26 => CLIENT_JOIN, "Client Join Team";
    27 => CLIENT_NAME_CHANGE, "Client Name Change";
    28 => CLIENT_TEAM_CHANGE, "Client Team Change";
    29 => CLIENT_ITEM_PICKUP, "Client Item Pickup";
    30 => CLIENT_ACTION, "Client Action";
    31 => CLIENT_KICK, "Client Kicked";
    32 => CLIENT_BAN, "Client Banned";
    33 => CLIENT_BAN_TEMP, "Client Temp Banned";
    34 => CLIENT_UNBAN, "Client Unbanned";
    35 => CLIENT_WARN, "Client Warned";
    36 => CLIENT_NOTICE, "Client Notice";
    37 => CLIENT_PUBLIC, "Server Public Mode Changed";
    38 => CLIENT_SPAWN, "Client Spawn";
    39 => CLIENT_RADIO, "Client Radio";
    40 => CLIENT_CALLVOTE, "Client Call Vote";
    41 => CLIENT_VOTE, "Client Vote";
    42 => CLIENT_GEAR_CHANGE, "Client Gear Change";
    43 => CLIENT_FLAG_PICKUP, "Client Flag Pickup";
    44 => CLIENT_FLAG_DROPPED, "Client Flag Dropped";
    45 => CLIENT_FLAG_CAPTURED, "Client Flag Captured";
    46 => CLIENT_FLAG_RETURNED, "Client Flag Returned";
    47 => CLIENT_BOMB_PLANTED, "Client Bomb Planted";
    48 => CLIENT_BOMB_DEFUSED, "Client Bomb Defused";
    49 => GAME_ROUND_START, "Game Round Start";
    50 => GAME_ROUND_END, "Game Round End";
    51 => GAME_WARMUP, "Game Warmup";
    52 => GAME_EXIT, "Game Exit";
    53 => GAME_MAP_CHANGE, "Game Map Change";
    54 => GAME_FLAG_RETURNED, "Flag Returned";
    55 => GAME_BOMB_EXPLODED, "Bomb Exploded";
    56 => GAME_SURVIVOR_WIN, "Survivor Winner";
    57 => VOTE_PASSED, "Vote Passed";
    58 => VOTE_FAILED, "Vote Failed";
    59 => CONSOLE_SAY, "Console Say";
    60 => SERVER_RESTART, "Server Restart";
    61 => SERVER_UNREACHABLE, "Server Unreachable";
    62 => SERVER_READY, "Server Ready";
}

/// Built-in entry for `key`, if any.
pub fn by_key(key: &str) -> Option<&'static BuiltinEvent> {
    BUILTIN_EVENTS.iter().find(|e| e.key == key)
}

/// Built-in entry holding `id`, if any.
pub fn by_id(id: EventTypeId) -> Option<&'static BuiltinEvent> {
    BUILTIN_EVENTS.iter().find(|e| e.id == id)
}
