//! Fixed names that make up the on-disk layout of a Kherimoya root.

/// Separates a server's name from its identifier in directory and session names.
pub const DELIMITER: char = '@';

/// Directory under the root that holds one subdirectory per server.
pub const SERVERS_DIR: &str = "servers";

/// Working directory of the game server process, relative to a server directory.
pub const SERVER_SUBDIR: &str = "server";

/// Directory holding persisted runtime state.
pub const STATE_SUBDIR: &str = "state";

/// Subdirectories created for every new server.
pub const SKELETON_SUBDIRS: [&str; 4] = ["config", "extra", SERVER_SUBDIR, STATE_SUBDIR];

/// Metadata record rewritten by every refresh.
pub const SERVER_RECORD_FILE: &str = "server.json";

/// Running-state record, relative to the state subdirectory.
pub const STATE_RECORD_FILE: &str = "state.json";

/// Creation-method marker written once creation completes.
pub const TYPE_RECORD_FILE: &str = "kherimoya.yaml";

/// Created by the launcher under its working directory once first-run install is done.
pub const INSTALL_MARKER_DIR: &str = "worlds";

/// Characters a server name may never contain, in addition to [`DELIMITER`].
pub const FORBIDDEN_NAME_CHARS: [char; 4] = ['-', ':', '/', '\\'];

/// Line sent to the launcher to request a graceful shutdown.
pub const STOP_COMMAND: &str = "stop";
