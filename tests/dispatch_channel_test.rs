//! Integration tests for the command/acknowledge dispatch channel.
//!
//! Exercise the requester/executor pairing end to end: ordering, reply
//! correlation, back-pressure, and endpoint loss.

use serde_json::json;
use stain_master::dispatch::{DispatchChannel, DispatchError};
use stain_master::messages::{AckStatus, Command};

#[tokio::test]
async fn commands_are_delivered_fifo_under_load() {
    let (mut requester, mut executor) = DispatchChannel::bounded(64);

    let mut sent = Vec::new();
    for i in 0..50 {
        let reference = requester
            .send(Command::new(format!("CmdStep{i}")))
            .unwrap();
        sent.push((reference, format!("CmdStep{i}")));
    }

    for (expected_ref, expected_name) in sent {
        let (reference, command, _handle) = executor.next_command().await.unwrap();
        assert_eq!(reference, expected_ref);
        assert_eq!(command.name, expected_name);
    }
}

#[tokio::test]
async fn replies_correlate_even_when_executor_answers_out_of_order() {
    let (mut requester, mut executor) = DispatchChannel::bounded(8);
    let first = requester.send(Command::new("CmdOvenOn")).unwrap();
    let second = requester.send(Command::new("CmdWaterOn")).unwrap();

    let (_, _, handle_a) = executor.next_command().await.unwrap();
    let (_, _, handle_b) = executor.next_command().await.unwrap();

    // Second command answered first.
    handle_b.reply(AckStatus::Nack, json!({})).await.unwrap();
    handle_a
        .reply(AckStatus::Ok, json!({"temp": 62}))
        .await
        .unwrap();

    let ack1 = requester.next_ack().await.unwrap();
    let ack2 = requester.next_ack().await.unwrap();
    assert_eq!(ack1.reference, second);
    assert_eq!(ack1.status, AckStatus::Nack);
    assert_eq!(ack2.reference, first);
    assert!(ack2.status.is_ok());
    assert_eq!(requester.outstanding(), 0);
}

#[tokio::test]
async fn executor_work_continues_while_requester_queues() {
    let (mut requester, mut executor) = DispatchChannel::bounded(4);

    let worker = tokio::spawn(async move {
        let mut served = 0;
        while let Some((_, command, handle)) = executor.next_command().await {
            let status = if command.name == "CmdDrainWater" {
                AckStatus::Failed("drain blocked".to_string())
            } else {
                AckStatus::Ok
            };
            handle.reply(status, json!({})).await.unwrap();
            served += 1;
        }
        served
    });

    requester.send(Command::new("CmdOvenOn")).unwrap();
    assert!(requester.next_ack().await.unwrap().status.is_ok());

    requester.send(Command::new("CmdDrainWater")).unwrap();
    let ack = requester.next_ack().await.unwrap();
    assert_eq!(ack.status, AckStatus::Failed("drain blocked".to_string()));

    drop(requester);
    assert_eq!(worker.await.unwrap(), 2);
}

#[tokio::test]
async fn backpressure_fails_fast_and_recovers() {
    let (mut requester, mut executor) = DispatchChannel::bounded(2);
    requester.send(Command::new("CmdLoaderOpen")).unwrap();
    requester.send(Command::new("CmdLoaderClose")).unwrap();
    assert_eq!(
        requester.send(Command::new("CmdLoaderOpen")),
        Err(DispatchError::MailboxFull)
    );

    // Draining one slot makes the channel usable again.
    let (_, _, handle) = executor.next_command().await.unwrap();
    handle.reply(AckStatus::Ok, json!({})).await.unwrap();
    assert!(requester.send(Command::new("CmdLoaderOpen")).is_ok());
}

#[tokio::test]
async fn both_endpoints_report_the_peer_going_away() {
    let (mut requester, mut executor) = DispatchChannel::bounded(4);
    requester.send(Command::new("CmdGrapplerPark")).unwrap();
    let (_, _, handle) = executor.next_command().await.unwrap();

    drop(requester);
    assert_eq!(
        handle.reply(AckStatus::Ok, json!({})).await,
        Err(DispatchError::ChannelNotBound)
    );

    let (mut requester, executor) = DispatchChannel::bounded(4);
    drop(executor);
    assert_eq!(
        requester.send(Command::new("CmdGrapplerPark")),
        Err(DispatchError::ChannelNotBound)
    );
    // And the ack stream ends rather than hanging.
    assert!(requester.next_ack().await.is_none());
}
