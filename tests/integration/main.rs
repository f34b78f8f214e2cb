// Integration scenarios run against the in-process broker. The
// `live_broker` tests need a real RabbitMQ and are ignored by default.

mod common;
mod delivery;
mod live_broker;
mod reconnect;
